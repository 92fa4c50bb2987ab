//! Desired watch state produced by the surrounding reconciliation system.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{ConsumerKey, LabelSelector, Namespace, SelectorError, Uid};

/// One namespace to watch, optionally pinned to a deployed object's UID.
///
/// A ref without a UID contributes only its namespace: the resource hasn't been
/// deployed yet, or the consumer relies on extra selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRef {
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    #[serde(default)]
    pub watches: Vec<WatchRef>,
    #[serde(default)]
    pub extra_selectors: Vec<LabelSelector>,
}

impl WatchSpec {
    pub fn namespace(mut self, ns: &str) -> Self {
        self.watches.push(WatchRef { namespace: Namespace::from(ns), uid: None });
        self
    }

    pub fn uid(mut self, ns: &str, uid: &str) -> Self {
        self.watches.push(WatchRef { namespace: Namespace::from(ns), uid: Some(Uid::from(uid)) });
        self
    }

    pub fn selector(mut self, sel: LabelSelector) -> Self {
        self.extra_selectors.push(sel);
        self
    }

    pub fn namespaces(&self) -> BTreeSet<Namespace> {
        self.watches.iter().map(|w| w.namespace.clone()).collect()
    }

    pub fn uids(&self) -> BTreeSet<Uid> {
        self.watches
            .iter()
            .filter_map(|w| w.uid.clone())
            .filter(|u| !u.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<(), SelectorError> {
        self.extra_selectors.iter().try_for_each(LabelSelector::validate)
    }
}

/// The full desired state, keyed by consumer. Iteration order is deterministic.
pub type DesiredState = BTreeMap<ConsumerKey, WatchSpec>;
