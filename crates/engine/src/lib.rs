//! kdisco engine: maps live Pod/Event/Service objects back to the consumer
//! that should hear about them, while sharing one watch per namespace.
//!
//! One [`Engine`] serves one object kind. All discovery tables live behind a
//! single engine-wide lock; dispatch loops, owner-tree lookups and reconcile
//! passes all funnel through it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kdisco_core::{ClusterClient, ConsumerKey, Dispatch, LabelSelector, Namespace, OwnerFetcher, Uid, WatchSpec, WatchedObject};
use kdisco_store::Tables;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod dispatch;
mod error;
pub mod fake;
mod mux;
mod reconcile;

pub use config::{EngineConfig, DEFAULT_MAX_INFLIGHT};
pub use error::EngineError;
pub use reconcile::ReconcileSummary;

use mux::NamespaceWatches;

/// Everything guarded by the engine lock.
#[derive(Debug, Default)]
struct State {
    tables: Tables,
    watches: NamespaceWatches,
    /// Last successfully applied spec per consumer.
    applied: BTreeMap<ConsumerKey, WatchSpec>,
}

struct Inner {
    cfg: EngineConfig,
    client: Arc<dyn ClusterClient>,
    owners: Arc<dyn OwnerFetcher>,
    dispatcher: Arc<dyn Dispatch>,
    state: Mutex<State>,
    inflight: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

/// Handle to a watch & dispatch engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("kind", &self.inner.cfg.kind).finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(cfg: EngineConfig, client: Arc<dyn ClusterClient>, owners: Arc<dyn OwnerFetcher>, dispatcher: Arc<dyn Dispatch>) -> Self {
        info!(kind = %cfg.kind, max_inflight = ?cfg.max_inflight_resolutions, "engine created");
        let inflight = cfg.max_inflight_resolutions.map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            inner: Arc::new(Inner {
                cfg,
                client,
                owners,
                dispatcher,
                state: Mutex::new(State::default()),
                inflight,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.inner.cfg }

    /// Apply the full desired state. Returns once table mutations are complete;
    /// replayed notifications are dispatched before this returns, live ones keep flowing after.
    pub async fn reconcile(&self, desired: &BTreeMap<ConsumerKey, WatchSpec>) -> ReconcileSummary {
        Arc::clone(&self.inner).reconcile(desired).await
    }

    /// Cancel every namespace watch and stop the engine. Later reconcile passes are ignored.
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        st.watches.cancel_all();
        self.inner.shutdown.cancel();
        info!(kind = %self.inner.cfg.kind, "engine shut down");
    }

    // ---- introspection (mostly for tests) ----

    /// Whether `consumer` is a watcher of an active watch on `ns`.
    pub async fn has_namespace_watch(&self, ns: &Namespace, consumer: &ConsumerKey) -> bool {
        self.inner.state.lock().await.watches.has_watcher(ns, consumer)
    }

    pub async fn watched_namespaces(&self) -> Vec<Namespace> { self.inner.state.lock().await.watches.namespaces() }

    pub async fn extra_selectors(&self, consumer: &ConsumerKey) -> Vec<LabelSelector> {
        self.inner.state.lock().await.tables.selectors.get(consumer).to_vec()
    }

    /// The consumer currently holding a claim on `uid`, if any.
    pub async fn claimant(&self, uid: &Uid) -> Option<ConsumerKey> {
        self.inner.state.lock().await.tables.claims.claimant(uid).cloned()
    }

    /// UIDs recorded as descendants of `owner` so far.
    pub async fn descendants(&self, owner: &Uid) -> Vec<Uid> {
        self.inner.state.lock().await.tables.descendants.descendants(owner).cloned().collect()
    }

    pub async fn known_object(&self, uid: &Uid) -> Option<Arc<WatchedObject>> {
        self.inner.state.lock().await.tables.known.get(uid).cloned()
    }
}
