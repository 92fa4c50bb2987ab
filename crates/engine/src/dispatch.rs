//! Per-namespace dispatch loops.

use std::sync::Arc;

use kdisco_core::{Action, Namespace, ObjectKind, ObjectUpdate, WatchedObject};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::Inner;

impl Inner {
    /// Kind-specific admission. Skipped objects are neither cached nor triaged.
    pub(crate) fn admit(&self, obj: &WatchedObject) -> bool {
        match self.cfg.kind {
            ObjectKind::Event => {
                if obj.creation_ts < self.cfg.events_since {
                    return false;
                }
                self.cfg.include_normal_events || obj.event_type.as_deref() != Some("Normal")
            }
            ObjectKind::Pod | ObjectKind::Service => true,
        }
    }

    /// Read one namespace watch until it closes or `cancel` fires.
    pub(crate) async fn run_namespace_loop(self: Arc<Self>, ns: Namespace, mut rx: mpsc::Receiver<ObjectUpdate>, cancel: CancellationToken) {
        let kind = self.cfg.kind;
        debug!(kind = %kind, ns = %ns, "dispatch loop started");
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind = %kind, ns = %ns, "dispatch loop canceled");
                    break;
                }
                maybe = rx.recv() => maybe,
            };
            match update {
                Some(ObjectUpdate::Upsert(obj)) => {
                    if !self.admit(&obj) {
                        trace!(kind = %kind, name = %obj.key(), "skipped by admission");
                        continue;
                    }
                    self.state.lock().await.tables.known.upsert(Arc::clone(&obj));

                    // only the permit wait can hold up the channel reader
                    let permit = match &self.inflight {
                        Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
                        None => None,
                    };
                    let me = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        me.resolve_and_dispatch(obj).await;
                    });
                }
                Some(ObjectUpdate::Deleted { namespace, name }) => {
                    self.state.lock().await.tables.known.forget(&namespace, &name);
                    counter!("kdisco_notifications_total", 1u64, "kind" => kind.as_str(), "path" => "delete");
                    self.dispatcher.dispatch(Action::Deleted { kind, namespace, name });
                }
                None => {
                    // the watch set entry stays; nothing re-establishes this watch
                    warn!(kind = %kind, ns = %ns, "watch channel closed by server; namespace no longer receiving updates");
                    counter!("kdisco_watch_closed_total", 1u64, "kind" => kind.as_str());
                    break;
                }
            }
        }
    }

    /// Resolve the owner tree without the lock, then triage and dispatch under it.
    pub(crate) async fn resolve_and_dispatch(&self, obj: Arc<WatchedObject>) {
        let kind = self.cfg.kind;
        let subject = obj.owner_subject();
        let tree = match self.owners.resolve_owner_tree(&subject).await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(kind = %kind, name = %obj.key(), uid = %subject.uid, error = %e, "owner tree resolution failed; dropping update");
                counter!("kdisco_owner_resolution_failures_total", 1u64, "kind" => kind.as_str());
                return;
            }
        };

        let mut st = self.state.lock().await;
        // a newer update may have landed while we were resolving; triage and deliver that one
        let Some(fresh) = st.tables.known.get(&obj.uid).cloned() else {
            trace!(kind = %kind, name = %obj.key(), "object deleted before dispatch");
            return;
        };
        let results = st.tables.triage(&fresh, &tree);
        for r in results {
            let path = if r.ancestor.is_some() { "owner" } else { "selector" };
            counter!("kdisco_notifications_total", 1u64, "kind" => kind.as_str(), "path" => path);
            trace!(kind = %kind, name = %fresh.key(), consumer = %r.consumer, path, "dispatch");
            self.dispatcher.dispatch(Action::Changed { consumer: r.consumer, object: Arc::clone(&fresh), ancestor: r.ancestor });
        }
    }
}
