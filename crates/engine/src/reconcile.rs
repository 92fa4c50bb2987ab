//! Desired-state diff: adjusts namespace watches, claims and selectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kdisco_core::{Action, ConsumerKey, Namespace, Uid, WatchSpec};
use kdisco_store::{ClaimOutcome, Tables};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::{EngineError, Inner, State};

/// What a reconcile pass changed.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub watches_started: usize,
    pub watches_canceled: usize,
    pub claims_granted: usize,
    pub claims_released: usize,
    pub replayed: usize,
    pub errors: Vec<EngineError>,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.watches_started == 0
            && self.watches_canceled == 0
            && self.claims_granted == 0
            && self.claims_released == 0
            && self.replayed == 0
            && self.errors.is_empty()
    }
}

impl Inner {
    pub(crate) async fn reconcile(self: Arc<Self>, desired: &BTreeMap<ConsumerKey, WatchSpec>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        if self.shutdown.is_cancelled() {
            warn!(kind = %self.cfg.kind, "reconcile after shutdown ignored");
            return summary;
        }

        let mut guard = self.state.lock().await;
        let st: &mut State = &mut guard;
        let mut failed_ns: BTreeSet<Namespace> = BTreeSet::new();
        let mut accepted: BTreeMap<ConsumerKey, WatchSpec> = BTreeMap::new();

        for (key, spec) in desired {
            if let Err(source) = spec.validate() {
                warn!(kind = %self.cfg.kind, consumer = %key, error = %source, "invalid watch spec; keeping previous state");
                summary.errors.push(EngineError::InvalidSpec { consumer: key.clone(), source });
                if let Some(prev) = st.applied.get(key) {
                    accepted.insert(key.clone(), prev.clone());
                }
                continue;
            }

            for ns in spec.namespaces() {
                self.ensure_watch(st, &ns, key, &mut failed_ns, &mut summary).await;
            }
            for uid in spec.uids() {
                if !st.tables.claims.holds(&uid, key) {
                    self.establish_claim(&mut st.tables, &uid, key, &mut summary);
                }
            }
            st.tables.selectors.replace(key, spec.extra_selectors.clone());
            accepted.insert(key.clone(), spec.clone());
        }

        let mut released: Vec<Uid> = Vec::new();
        for (key, prev) in &st.applied {
            let next = accepted.get(key);
            let next_ns = next.map(WatchSpec::namespaces).unwrap_or_default();
            let next_uids = next.map(WatchSpec::uids).unwrap_or_default();
            for ns in prev.namespaces().difference(&next_ns) {
                st.watches.leave(ns, key);
            }
            for uid in prev.uids().difference(&next_uids) {
                if st.tables.claims.release(uid, key) {
                    debug!(kind = %self.cfg.kind, uid = %uid, consumer = %key, "claim released");
                    summary.claims_released += 1;
                    released.push(uid.clone());
                }
            }
            if next.is_none() {
                st.tables.selectors.remove(key);
                info!(kind = %self.cfg.kind, consumer = %key, "consumer removed");
            }
        }

        // a released UID goes to the first remaining consumer (key order) that still wants it
        for uid in released {
            if let Some(key) = accepted.iter().find(|(_, s)| s.uids().contains(&uid)).map(|(k, _)| k) {
                self.establish_claim(&mut st.tables, &uid, key, &mut summary);
            }
        }

        st.applied = accepted;

        for ns in st.watches.cleanup_abandoned() {
            info!(kind = %self.cfg.kind, ns = %ns, "namespace watch canceled (no watchers left)");
            counter!("kdisco_watches_canceled_total", 1u64, "kind" => self.cfg.kind.as_str());
            summary.watches_canceled += 1;
        }
        gauge!("kdisco_active_watches", st.watches.len() as f64, "kind" => self.cfg.kind.as_str());

        debug!(
            kind = %self.cfg.kind,
            consumers = st.applied.len(),
            started = summary.watches_started,
            canceled = summary.watches_canceled,
            granted = summary.claims_granted,
            released = summary.claims_released,
            replayed = summary.replayed,
            errors = summary.errors.len(),
            "reconcile pass complete"
        );
        summary
    }

    /// Join or open the watch for `ns`. A namespace that failed earlier in this pass is not retried.
    async fn ensure_watch(
        self: &Arc<Self>,
        st: &mut State,
        ns: &Namespace,
        key: &ConsumerKey,
        failed: &mut BTreeSet<Namespace>,
        summary: &mut ReconcileSummary,
    ) {
        if st.watches.join(ns, key) || failed.contains(ns) {
            return;
        }
        let kind = self.cfg.kind;
        let cancel = self.shutdown.child_token();
        match self.client.watch_namespace(kind, ns, cancel.clone()).await {
            Ok(rx) => {
                st.watches.insert(ns.clone(), cancel.clone(), key.clone());
                info!(kind = %kind, ns = %ns, consumer = %key, "namespace watch started");
                counter!("kdisco_watches_started_total", 1u64, "kind" => kind.as_str());
                summary.watches_started += 1;
                tokio::spawn(Arc::clone(self).run_namespace_loop(ns.clone(), rx, cancel));
            }
            Err(source) => {
                failed.insert(ns.clone());
                let message = format!(
                    "Error watching {kind}s. Are you connected to kubernetes?\nTry running `kubectl get {kind}s -n {ns:?}`: {source}",
                    ns = ns.as_str()
                );
                warn!(kind = %kind, ns = %ns, error = %source, "namespace watch failed; will retry on next reconcile");
                counter!("kdisco_watch_errors_total", 1u64, "kind" => kind.as_str());
                self.dispatcher.dispatch(Action::WatchError { kind, namespace: ns.clone(), message });
                summary.errors.push(EngineError::Watch { namespace: ns.clone(), source });
            }
        }
    }

    /// Claim `uid` for `key`; a new grant replays everything already known under it.
    fn establish_claim(&self, tables: &mut Tables, uid: &Uid, key: &ConsumerKey, summary: &mut ReconcileSummary) {
        let kind = self.cfg.kind;
        match tables.claims.establish(uid, key) {
            ClaimOutcome::Granted => {
                let replay = tables.replay_for(uid);
                debug!(kind = %kind, uid = %uid, consumer = %key, replay = replay.len(), "claim granted");
                summary.claims_granted += 1;
                for obj in replay {
                    counter!("kdisco_notifications_total", 1u64, "kind" => kind.as_str(), "path" => "replay");
                    summary.replayed += 1;
                    self.dispatcher.dispatch(Action::Changed { consumer: key.clone(), object: obj, ancestor: Some(uid.clone()) });
                }
            }
            ClaimOutcome::AlreadyHeld => {}
            ClaimOutcome::Conflict(holder) => {
                debug!(kind = %kind, uid = %uid, consumer = %key, holder = %holder, "claim held by another consumer");
                counter!("kdisco_claim_conflicts_total", 1u64, "kind" => kind.as_str());
            }
        }
    }
}
