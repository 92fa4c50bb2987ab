//! Namespace watch set: one live watch per namespace, shared by every consumer
//! that wants it.

use std::collections::{BTreeMap, BTreeSet};

use kdisco_core::{ConsumerKey, Namespace};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct NsWatch {
    cancel: CancellationToken,
    watchers: BTreeSet<ConsumerKey>,
}

#[derive(Debug, Default)]
pub(crate) struct NamespaceWatches {
    map: BTreeMap<Namespace, NsWatch>,
}

impl NamespaceWatches {
    pub(crate) fn is_watched(&self, ns: &Namespace) -> bool { self.map.contains_key(ns) }

    /// Add `consumer` to an existing watch. Returns false if `ns` has no watch.
    pub(crate) fn join(&mut self, ns: &Namespace, consumer: &ConsumerKey) -> bool {
        match self.map.get_mut(ns) {
            Some(w) => {
                w.watchers.insert(consumer.clone());
                true
            }
            None => false,
        }
    }

    /// Record a freshly established watch with its first watcher.
    pub(crate) fn insert(&mut self, ns: Namespace, cancel: CancellationToken, consumer: ConsumerKey) {
        let watchers = BTreeSet::from([consumer]);
        self.map.insert(ns, NsWatch { cancel, watchers });
    }

    /// Drop `consumer` from the watcher set; the watch itself stays until [`Self::cleanup_abandoned`].
    pub(crate) fn leave(&mut self, ns: &Namespace, consumer: &ConsumerKey) {
        if let Some(w) = self.map.get_mut(ns) {
            w.watchers.remove(consumer);
        }
    }

    /// Cancel and remove every watch with no watchers left.
    pub(crate) fn cleanup_abandoned(&mut self) -> Vec<Namespace> {
        let abandoned: Vec<Namespace> = self.map.iter().filter(|(_, w)| w.watchers.is_empty()).map(|(ns, _)| ns.clone()).collect();
        for ns in &abandoned {
            if let Some(w) = self.map.remove(ns) {
                w.cancel.cancel();
            }
        }
        abandoned
    }

    pub(crate) fn has_watcher(&self, ns: &Namespace, consumer: &ConsumerKey) -> bool {
        self.map.get(ns).map(|w| w.watchers.contains(consumer)).unwrap_or(false)
    }

    pub(crate) fn namespaces(&self) -> Vec<Namespace> { self.map.keys().cloned().collect() }

    pub(crate) fn len(&self) -> usize { self.map.len() }

    pub(crate) fn cancel_all(&mut self) {
        for (_, w) in std::mem::take(&mut self.map) {
            w.cancel.cancel();
        }
    }
}
