//! In-process cluster double: injectable owner trees, emitting watch updates,
//! and failure injection for watch setup and owner lookups.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kdisco_core::{
    ClientError, ClusterClient, Namespace, ObjectKind, ObjectRef, ObjectUpdate, OwnerFetcher, OwnerReference, OwnerTree, Uid,
    WatchedObject,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FAKE_WATCH_BUFFER: usize = 64;

struct FakeWatch {
    tx: mpsc::Sender<ObjectUpdate>,
    cancel: CancellationToken,
}

impl FakeWatch {
    fn is_live(&self) -> bool { !self.cancel.is_cancelled() && !self.tx.is_closed() }
}

#[derive(Default)]
struct FakeState {
    watches: HashMap<(ObjectKind, Namespace), Vec<FakeWatch>>,
    watch_calls: HashMap<Namespace, usize>,
    failing_namespaces: HashSet<Namespace>,
    trees: HashMap<Uid, OwnerTree>,
    failing_owner_lookups: HashSet<Uid>,
    owner_delay: Option<Duration>,
}

/// A fake cluster implementing both [`ClusterClient`] and [`OwnerFetcher`].
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut st)
    }

    /// Register the owner tree returned for its root UID.
    pub fn inject_tree(&self, tree: OwnerTree) {
        self.with_state(|st| {
            st.trees.insert(tree.reference.uid.clone(), tree);
        });
    }

    pub fn fail_watches(&self, ns: &str, fail: bool) {
        self.with_state(|st| {
            if fail {
                st.failing_namespaces.insert(Namespace::from(ns));
            } else {
                st.failing_namespaces.remove(&Namespace::from(ns));
            }
        });
    }

    pub fn fail_owner_lookup(&self, uid: &str, fail: bool) {
        self.with_state(|st| {
            if fail {
                st.failing_owner_lookups.insert(Uid::from(uid));
            } else {
                st.failing_owner_lookups.remove(&Uid::from(uid));
            }
        });
    }

    /// Delay every owner lookup, simulating a slow API server.
    pub fn set_owner_delay(&self, delay: Option<Duration>) { self.with_state(|st| st.owner_delay = delay); }

    /// How many times a watch was requested for `ns` (successful or not).
    pub fn watch_calls(&self, ns: &str) -> usize {
        self.with_state(|st| st.watch_calls.get(&Namespace::from(ns)).copied().unwrap_or(0))
    }

    /// Watches on `ns` that are neither canceled nor dropped by the reader.
    pub fn live_watches(&self, kind: ObjectKind, ns: &str) -> usize {
        self.with_state(|st| {
            st.watches
                .get(&(kind, Namespace::from(ns)))
                .map(|ws| ws.iter().filter(|w| w.is_live()).count())
                .unwrap_or(0)
        })
    }

    /// Send `update` to every live watch on (`kind`, `ns`). Returns the number of receivers.
    pub async fn emit(&self, kind: ObjectKind, ns: &str, update: ObjectUpdate) -> usize {
        let senders: Vec<mpsc::Sender<ObjectUpdate>> = self.with_state(|st| {
            st.watches
                .get(&(kind, Namespace::from(ns)))
                .map(|ws| ws.iter().filter(|w| w.is_live()).map(|w| w.tx.clone()).collect())
                .unwrap_or_default()
        });
        let mut delivered = 0;
        for tx in senders {
            if tx.send(update.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn emit_object(&self, obj: WatchedObject) -> usize {
        let ns = obj.namespace.clone();
        self.emit(obj.kind, ns.as_str(), ObjectUpdate::Upsert(Arc::new(obj))).await
    }

    /// Drop the server side of every watch on (`kind`, `ns`), as if the server ended them.
    pub fn close_watches(&self, kind: ObjectKind, ns: &str) {
        self.with_state(|st| {
            st.watches.remove(&(kind, Namespace::from(ns)));
        });
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn watch_namespace(&self, kind: ObjectKind, namespace: &Namespace, cancel: CancellationToken) -> Result<mpsc::Receiver<ObjectUpdate>, ClientError> {
        self.with_state(|st| {
            *st.watch_calls.entry(namespace.clone()).or_default() += 1;
            if st.failing_namespaces.contains(namespace) {
                return Err(ClientError::Transport(format!("connection refused watching {kind}s in {namespace}")));
            }
            let (tx, rx) = mpsc::channel(FAKE_WATCH_BUFFER);
            st.watches.entry((kind, namespace.clone())).or_default().push(FakeWatch { tx, cancel });
            Ok(rx)
        })
    }
}

#[async_trait::async_trait]
impl OwnerFetcher for FakeCluster {
    async fn resolve_owner_tree(&self, subject: &ObjectRef) -> Result<OwnerTree, ClientError> {
        let delay = self.with_state(|st| st.owner_delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.with_state(|st| {
            if st.failing_owner_lookups.contains(&subject.uid) {
                return Err(ClientError::Api { code: 500, message: format!("lookup of {} failed", subject.uid) });
            }
            // unknown objects have no resolvable owners
            Ok(st.trees.get(&subject.uid).cloned().unwrap_or_else(|| OwnerTree::leaf(subject.clone())))
        })
    }
}

// ---- builders ----

fn reference(kind: &str, ns: &str, name: &str, uid: &str) -> ObjectRef {
    let api_version = match kind {
        "Deployment" | "ReplicaSet" | "StatefulSet" | "DaemonSet" => "apps/v1",
        "Job" => "batch/v1",
        _ => "v1",
    };
    ObjectRef { api_version: api_version.into(), kind: kind.into(), namespace: Some(ns.into()), name: name.into(), uid: Uid::from(uid) }
}

/// A single-owner chain from the object up to its root, e.g.
/// `chain("default", &[("Pod", "pod-a"), ("ReplicaSet", "rs-1"), ("Deployment", "dep-1")])`.
/// Names double as UIDs.
pub fn chain(ns: &str, links: &[(&str, &str)]) -> OwnerTree {
    let mut iter = links.iter().rev();
    let Some((kind, name)) = iter.next() else {
        return OwnerTree::default();
    };
    let mut tree = OwnerTree::leaf(reference(kind, ns, name, name));
    for (kind, name) in iter {
        tree = OwnerTree::leaf(reference(kind, ns, name, name)).with_owner(tree);
    }
    tree
}

/// A Pod whose UID equals its name, owned by `owner` (a `(kind, name)` pair) if given.
pub fn pod(ns: &str, name: &str, owner: Option<(&str, &str)>) -> WatchedObject {
    let mut p = WatchedObject::new(ObjectKind::Pod, name, ns, name);
    p.resource_version = "1".to_string();
    if let Some((kind, owner_name)) = owner {
        let r = reference(kind, ns, owner_name, owner_name);
        p.owners.push(OwnerReference { api_version: r.api_version, kind: r.kind, name: r.name, uid: r.uid });
    }
    p
}

/// A warning Event about `involved` (a `(kind, name)` pair whose name doubles as UID).
pub fn warning_event(ns: &str, name: &str, involved: (&str, &str), creation_ts: i64) -> WatchedObject {
    let mut ev = WatchedObject::new(ObjectKind::Event, name, ns, name);
    ev.event_type = Some("Warning".to_string());
    ev.creation_ts = creation_ts;
    ev.involved = Some(reference(involved.0, ns, involved.1, involved.1));
    ev
}

pub fn with_labels(mut obj: WatchedObject, labels: &[(&str, &str)]) -> WatchedObject {
    obj.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    obj
}
