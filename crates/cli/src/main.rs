use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kdisco_core::{Action, Namespace, ObjectKind, OwnerFetcher};
use kdisco_engine::{Engine, EngineConfig, ReconcileSummary};
use kdisco_kubehub::{KubeClusterClient, KubeOwnerFetcher};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

mod desired;
mod render;

#[derive(Parser, Debug)]
#[command(name = "kdiscoctl", version, about = "kdisco: ownership-based watch and dispatch")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Object kind: pod, event or service
    #[arg(long = "kind", global = true, default_value = "pod")]
    kind: ObjectKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an engine against a desired-state file and print notifications
    Watch {
        /// Desired-state file (YAML, or JSON with a .json extension)
        #[arg(long = "spec")]
        spec: PathBuf,
        /// Re-read the file every N seconds and reconcile on change (0 = never)
        #[arg(long = "reload-secs", default_value_t = 0)]
        reload_secs: u64,
    },
    /// Print the owner tree of one object
    Owners {
        namespace: String,
        name: String,
    },
    /// Validate a desired-state file without contacting a cluster
    Check {
        #[arg(long = "spec")]
        spec: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("KDISCO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDISCO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KDISCO_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { spec, reload_secs } => run_watch(cli.kind, cli.output, &spec, reload_secs).await,
        Commands::Owners { namespace, name } => run_owners(cli.kind, cli.output, &namespace, &name).await,
        Commands::Check { spec } => run_check(cli.output, &spec),
    }
}

async fn run_watch(kind: ObjectKind, output: Output, spec: &Path, reload_secs: u64) -> Result<()> {
    let (mut text, state) = desired::load(spec)?;
    info!(kind = %kind, spec = %spec.display(), consumers = state.len(), "watch invoked");
    let client = kdisco_kubehub::get_kube_client().await.context("connecting to kubernetes")?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();
    let engine = Engine::new(
        EngineConfig::from_env(kind),
        Arc::new(KubeClusterClient::new(client.clone())),
        Arc::new(KubeOwnerFetcher::new(client)),
        Arc::new(tx),
    );

    let mut current = state;
    // failed watches are only retried by another pass, so keep reconciling while errors remain
    let mut retry = report(&engine.reconcile(&current).await);
    let mut tick = tokio::time::interval(Duration::from_secs(reload_secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(action) => print_action(&action, output)?,
                    None => break,
                }
            }
            _ = tick.tick(), if reload_secs > 0 => {
                match desired::load(spec) {
                    Ok((next_text, next)) if next_text != text => {
                        info!(spec = %spec.display(), consumers = next.len(), "desired state changed; reconciling");
                        text = next_text;
                        current = next;
                        retry = report(&engine.reconcile(&current).await);
                    }
                    Ok(_) if retry => retry = report(&engine.reconcile(&current).await),
                    Ok(_) => {}
                    Err(e) => warn!(error = %format!("{e:#}"), "reload failed; keeping previous desired state"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// Log a reconcile pass; returns whether it left errors behind.
fn report(summary: &ReconcileSummary) -> bool {
    for e in &summary.errors {
        warn!(error = %e, "reconcile error");
    }
    info!(
        started = summary.watches_started,
        canceled = summary.watches_canceled,
        granted = summary.claims_granted,
        released = summary.claims_released,
        replayed = summary.replayed,
        errors = summary.errors.len(),
        "reconciled"
    );
    !summary.errors.is_empty()
}

fn print_action(action: &Action, output: Output) -> Result<()> {
    match output {
        Output::Human => println!("{}", render::action_line(action)),
        Output::Json => println!("{}", serde_json::to_string(action)?),
    }
    Ok(())
}

async fn run_owners(kind: ObjectKind, output: Output, namespace: &str, name: &str) -> Result<()> {
    info!(kind = %kind, ns = %namespace, name = %name, "owners invoked");
    let client = kdisco_kubehub::get_kube_client().await.context("connecting to kubernetes")?;
    let hub = KubeClusterClient::new(client.clone());
    let Some(obj) = hub.get(kind, &Namespace::from(namespace), name).await? else {
        bail!("{kind} {namespace}/{name} not found");
    };
    let tree = KubeOwnerFetcher::new(client)
        .resolve_owner_tree(&obj.owner_subject())
        .await
        .with_context(|| format!("resolving owners of {}", obj.key()))?;

    match output {
        Output::Human => {
            for line in render::tree_lines(&tree, chrono::Utc::now().timestamp()) {
                println!("{line}");
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
    }
    Ok(())
}

fn run_check(output: Output, spec: &Path) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Row {
        consumer: String,
        namespaces: Vec<String>,
        uids: Vec<String>,
        selectors: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }

    let (_, state) = desired::load(spec)?;
    let rows: Vec<Row> = state
        .iter()
        .map(|(key, ws)| Row {
            consumer: key.to_string(),
            namespaces: ws.namespaces().into_iter().map(|n| n.0).collect(),
            uids: ws.uids().into_iter().map(|u| u.0).collect(),
            selectors: ws.extra_selectors.iter().map(ToString::to_string).collect(),
            error: ws.validate().err().map(|e| e.to_string()),
        })
        .collect();

    match output {
        Output::Human => {
            println!("CONSUMER         NAMESPACES           UIDS  SELECTORS");
            for r in &rows {
                let status = r.error.as_deref().map(|e| format!("  ERROR: {e}")).unwrap_or_default();
                println!("{:<16} {:<20} {:<5} {}{}", r.consumer, r.namespaces.join(","), r.uids.len(), r.selectors.join(" | "), status);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }

    let invalid = rows.iter().filter(|r| r.error.is_some()).count();
    if invalid > 0 {
        bail!("{invalid} invalid consumer spec(s) in {}", spec.display());
    }
    Ok(())
}
