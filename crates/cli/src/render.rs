use kdisco_core::{Action, OwnerTree};

pub fn action_line(action: &Action) -> String {
    match action {
        Action::Changed { consumer, object, ancestor } => {
            let via = ancestor.as_ref().map(|u| format!("owner {u}")).unwrap_or_else(|| "selector".to_string());
            format!("~ {:<16} {:<8} {:<40} rv={} via {}", consumer, object.kind, object.key(), object.resource_version, via)
        }
        Action::Deleted { kind, namespace, name } => format!("- {:<16} {:<8} {}/{}", "*", kind, namespace, name),
        Action::WatchError { kind, namespace, message } => format!("! {:<16} {:<8} {}: {}", "*", kind, namespace, message),
    }
}

pub fn tree_lines(tree: &OwnerTree, now: i64) -> Vec<String> {
    let mut out = Vec::new();
    push_tree(tree, 0, now, &mut out);
    out
}

fn push_tree(tree: &OwnerTree, depth: usize, now: i64, out: &mut Vec<String>) {
    let r = &tree.reference;
    out.push(format!("{:indent$}{}:{}  uid={}  age={}", "", r.kind, r.name, r.uid, render_age(tree.creation_ts, now), indent = depth * 2));
    for owner in &tree.owners {
        push_tree(owner, depth + 1, now, out);
    }
}

pub fn render_age(creation_ts: i64, now: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
