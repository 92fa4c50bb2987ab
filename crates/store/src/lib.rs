//! kdisco store: in-RAM discovery tables.
//!
//! Pure data structures; the engine owns one [`Tables`] behind its lock and is
//! the only writer.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kdisco_core::{ConsumerKey, LabelSelector, Namespace, OwnerTree, Uid, WatchedObject};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Owner UID -> UIDs of every object observed to be (transitively) owned by it.
///
/// Grows monotonically; entries are never pruned.
#[derive(Debug, Default)]
pub struct DescendantIndex {
    map: FxHashMap<Uid, BTreeSet<Uid>>,
}

impl DescendantIndex {
    pub fn record(&mut self, owner: &Uid, descendant: &Uid) {
        self.map.entry(owner.clone()).or_default().insert(descendant.clone());
    }

    pub fn descendants(&self, owner: &Uid) -> impl Iterator<Item = &Uid> + '_ {
        self.map.get(owner).into_iter().flat_map(|s| s.iter())
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

/// Last-seen value per resource UID, cached whether or not anyone claims it.
#[derive(Debug, Default)]
pub struct KnownObjects {
    by_uid: FxHashMap<Uid, Arc<WatchedObject>>,
    by_key: FxHashMap<(Namespace, String), Uid>,
}

impl KnownObjects {
    pub fn upsert(&mut self, obj: Arc<WatchedObject>) {
        let key = (obj.namespace.clone(), obj.name.clone());
        // recreated under the same name: the old incarnation is gone
        if let Some(prev) = self.by_key.insert(key, obj.uid.clone()) {
            if prev != obj.uid {
                self.by_uid.remove(&prev);
            }
        }
        self.by_uid.insert(obj.uid.clone(), obj);
    }

    pub fn get(&self, uid: &Uid) -> Option<&Arc<WatchedObject>> { self.by_uid.get(uid) }

    /// Forget a deleted object; returns its last value if it was known.
    pub fn forget(&mut self, namespace: &Namespace, name: &str) -> Option<Arc<WatchedObject>> {
        let uid = self.by_key.remove(&(namespace.clone(), name.to_string()))?;
        self.by_uid.remove(&uid)
    }

    pub fn len(&self) -> usize { self.by_uid.len() }
    pub fn is_empty(&self) -> bool { self.by_uid.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The UID was unclaimed and now belongs to the requester.
    Granted,
    /// The requester already held the claim.
    AlreadyHeld,
    /// Another consumer holds the claim; it is kept.
    Conflict(ConsumerKey),
}

/// Owner UID -> the single consumer responsible for it.
#[derive(Debug, Default)]
pub struct ClaimTable {
    map: FxHashMap<Uid, ConsumerKey>,
}

impl ClaimTable {
    /// First claim wins until it is released.
    pub fn establish(&mut self, uid: &Uid, consumer: &ConsumerKey) -> ClaimOutcome {
        match self.map.get(uid) {
            Some(existing) if existing == consumer => ClaimOutcome::AlreadyHeld,
            Some(existing) => ClaimOutcome::Conflict(existing.clone()),
            None => {
                self.map.insert(uid.clone(), consumer.clone());
                ClaimOutcome::Granted
            }
        }
    }

    /// Release `uid` if `consumer` holds it. Claims held by others are untouched.
    pub fn release(&mut self, uid: &Uid, consumer: &ConsumerKey) -> bool {
        if self.map.get(uid) == Some(consumer) {
            self.map.remove(uid);
            true
        } else {
            false
        }
    }

    pub fn claimant(&self, uid: &Uid) -> Option<&ConsumerKey> { self.map.get(uid) }

    pub fn holds(&self, uid: &Uid, consumer: &ConsumerKey) -> bool { self.map.get(uid) == Some(consumer) }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

/// Consumer -> fallback label selectors for objects with no claimed owner.
#[derive(Debug, Default)]
pub struct SelectorTable {
    map: BTreeMap<ConsumerKey, Vec<LabelSelector>>,
}

impl SelectorTable {
    /// Full replace; an empty list removes the entry.
    pub fn replace(&mut self, consumer: &ConsumerKey, selectors: Vec<LabelSelector>) {
        if selectors.is_empty() {
            self.map.remove(consumer);
        } else {
            self.map.insert(consumer.clone(), selectors);
        }
    }

    pub fn remove(&mut self, consumer: &ConsumerKey) { self.map.remove(consumer); }

    pub fn get(&self, consumer: &ConsumerKey) -> &[LabelSelector] {
        self.map.get(consumer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Consumers with at least one selector matching `obj`, in key order.
    pub fn matching(&self, obj: &WatchedObject) -> Vec<ConsumerKey> {
        let labels = obj.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        self.map
            .iter()
            .filter(|(_, sels)| sels.iter().any(|s| s.matches(labels.clone())))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Who should hear about an object, and through which claimed UID (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageResult {
    pub consumer: ConsumerKey,
    pub ancestor: Option<Uid>,
}

/// The discovery tables of one engine.
#[derive(Debug, Default)]
pub struct Tables {
    pub descendants: DescendantIndex,
    pub known: KnownObjects,
    pub claims: ClaimTable,
    pub selectors: SelectorTable,
}

impl Tables {
    pub fn new() -> Self { Self::default() }

    /// Record ownership facts for `obj` and resolve who is responsible for it.
    ///
    /// The first claimed UID in `tree` order wins. Only when nothing in the chain is
    /// claimed are the extra selectors consulted; every matching consumer gets a result
    /// with no ancestor.
    pub fn triage(&mut self, obj: &WatchedObject, tree: &OwnerTree) -> Vec<TriageResult> {
        let uids = tree.uids();
        for owner in &uids {
            self.descendants.record(owner, &obj.uid);
        }

        if let Some((uid, consumer)) = uids.iter().find_map(|u| self.claims.claimant(u).map(|c| (u, c))) {
            trace!(uid = %obj.uid, ancestor = %uid, consumer = %consumer, "triage: owner match");
            return vec![TriageResult { consumer: consumer.clone(), ancestor: Some(uid.clone()) }];
        }

        self.selectors
            .matching(obj)
            .into_iter()
            .map(|consumer| TriageResult { consumer, ancestor: None })
            .collect()
    }

    /// Objects to re-deliver to a consumer that was just granted `uid`.
    ///
    /// A known object with that UID is returned alone; otherwise every cached
    /// descendant, ordered by namespace/name.
    pub fn replay_for(&self, uid: &Uid) -> Vec<Arc<WatchedObject>> {
        if let Some(obj) = self.known.get(uid) {
            return vec![Arc::clone(obj)];
        }
        let mut out: Vec<Arc<WatchedObject>> = self
            .descendants
            .descendants(uid)
            .filter_map(|d| self.known.get(d).cloned())
            .collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        out
    }
}
