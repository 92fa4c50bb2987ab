//! kdisco core types: identifiers, watched objects, desired watch specs, and
//! the contracts the engine uses to talk to a cluster.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod object;
pub mod owner;
pub mod selector;
pub mod spec;

pub use client::{Action, ClientError, ClusterClient, Dispatch, OwnerFetcher};
pub use object::{ObjectRef, ObjectUpdate, OwnerReference, WatchedObject};
pub use owner::OwnerTree;
pub use selector::{LabelSelector, SelectorError, SelectorOp, SelectorRequirement};
pub use spec::{DesiredState, WatchRef, WatchSpec};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
            pub fn as_str(&self) -> &str { &self.0 }
            pub fn is_empty(&self) -> bool { self.0.is_empty() }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(&self.0) }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self { Self(s.to_string()) }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self { Self(s) }
        }
    };
}

string_id!(
    /// Kubernetes `metadata.uid` of a concrete object or of one of its owners.
    Uid
);
string_id!(
    /// Identifies the logical entity (one deployed application resource) that wants notifications.
    ConsumerKey
);
string_id!(Namespace);

/// The object kind a single engine instance watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Pod,
    Event,
    Service,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Pod => "pod",
            ObjectKind::Event => "event",
            ObjectKind::Service => "service",
        }
    }

    /// Kubernetes `kind` string for objects of this type.
    pub fn k8s_kind(&self) -> &'static str {
        match self {
            ObjectKind::Pod => "Pod",
            ObjectKind::Event => "Event",
            ObjectKind::Service => "Service",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(self.as_str()) }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" => Ok(ObjectKind::Pod),
            "event" | "events" => Ok(ObjectKind::Event),
            "service" | "services" | "svc" => Ok(ObjectKind::Service),
            other => Err(format!("unknown object kind: {other} (expect pod, event or service)")),
        }
    }
}

pub mod prelude {
    pub use super::{
        Action, ClusterClient, ConsumerKey, Dispatch, LabelSelector, Namespace, ObjectKind, ObjectRef,
        ObjectUpdate, OwnerFetcher, OwnerTree, Uid, WatchRef, WatchSpec, WatchedObject,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_common_aliases() {
        assert_eq!("Pods".parse::<ObjectKind>(), Ok(ObjectKind::Pod));
        assert_eq!("svc".parse::<ObjectKind>(), Ok(ObjectKind::Service));
        assert_eq!("event".parse::<ObjectKind>(), Ok(ObjectKind::Event));
        assert!("deployment".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn ids_order_and_serialize_as_plain_strings() {
        let mut keys = vec![ConsumerKey::from("fe2"), ConsumerKey::from("be"), ConsumerKey::from("fe")];
        keys.sort();
        assert_eq!(keys, vec![ConsumerKey::from("be"), ConsumerKey::from("fe"), ConsumerKey::from("fe2")]);
        assert_eq!(serde_json::to_string(&Uid::from("dep-1")).ok().as_deref(), Some("\"dep-1\""));
    }
}
