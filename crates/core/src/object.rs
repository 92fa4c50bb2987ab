//! Watched object values and watch channel updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Namespace, ObjectKind, Uid};

/// Reference to a Kubernetes object, enough to look up its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Uid,
}

/// The subset of `metadata.ownerReferences[*]` needed to walk an owner chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uid,
}

impl OwnerReference {
    /// Owner references carry no namespace; owners live in the namespace of the dependent.
    pub fn to_object_ref(&self, namespace: Option<&str>) -> ObjectRef {
        ObjectRef {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: namespace.map(|s| s.to_string()),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Last-observed value of a Pod, Event or Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedObject {
    pub kind: ObjectKind,
    pub uid: Uid,
    pub namespace: Namespace,
    pub name: String,
    pub resource_version: String,
    /// Unix seconds; 0 when unknown.
    pub creation_ts: i64,
    pub labels: SmallVec<[(String, String); 8]>,
    pub owners: SmallVec<[OwnerReference; 2]>,
    /// Events only: the object the event is about.
    pub involved: Option<ObjectRef>,
    /// Events only: `Normal` or `Warning`.
    pub event_type: Option<String>,
    /// Raw object with `metadata.managedFields` stripped.
    pub raw: serde_json::Value,
}

impl WatchedObject {
    pub fn new(kind: ObjectKind, uid: impl Into<Uid>, namespace: impl Into<Namespace>, name: impl Into<String>) -> Self {
        Self {
            kind,
            uid: uid.into(),
            namespace: namespace.into(),
            name: name.into(),
            resource_version: String::new(),
            creation_ts: 0,
            labels: SmallVec::new(),
            owners: SmallVec::new(),
            involved: None,
            event_type: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Reference to this object itself.
    pub fn to_ref(&self) -> ObjectRef {
        ObjectRef {
            // all watched kinds are core/v1
            api_version: "v1".to_string(),
            kind: self.kind.k8s_kind().to_string(),
            namespace: Some(self.namespace.0.clone()),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    /// The reference whose owner chain decides who is notified about this object.
    ///
    /// Events are attributed to their involved object; Pods and Services to themselves.
    pub fn owner_subject(&self) -> ObjectRef {
        match (&self.kind, &self.involved) {
            (ObjectKind::Event, Some(involved)) => involved.clone(),
            _ => self.to_ref(),
        }
    }

    pub fn key(&self) -> String { format!("{}/{}", self.namespace, self.name) }
}

/// One item read off a namespace watch channel.
#[derive(Debug, Clone)]
pub enum ObjectUpdate {
    Upsert(Arc<WatchedObject>),
    /// Tombstone: only the key of the deleted object is known.
    Deleted { namespace: Namespace, name: String },
}

impl ObjectUpdate {
    pub fn as_object(&self) -> Option<&Arc<WatchedObject>> {
        match self {
            ObjectUpdate::Upsert(o) => Some(o),
            ObjectUpdate::Deleted { .. } => None,
        }
    }

    pub fn as_deleted_key(&self) -> Option<(&Namespace, &str)> {
        match self {
            ObjectUpdate::Deleted { namespace, name } => Some((namespace, name.as_str())),
            ObjectUpdate::Upsert(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_owner_subject_is_involved_object() {
        let mut ev = WatchedObject::new(ObjectKind::Event, "ev-1", "default", "pod-a.17a");
        let involved = ObjectRef {
            api_version: "v1".into(),
            kind: "Pod".into(),
            namespace: Some("default".into()),
            name: "pod-a".into(),
            uid: Uid::from("pod-a"),
        };
        ev.involved = Some(involved.clone());
        assert_eq!(ev.owner_subject(), involved);

        let pod = WatchedObject::new(ObjectKind::Pod, "pod-a", "default", "pod-a");
        assert_eq!(pod.owner_subject().uid, Uid::from("pod-a"));
        assert_eq!(pod.owner_subject().kind, "Pod");
    }

    #[test]
    fn owner_reference_inherits_dependent_namespace() {
        let owner = OwnerReference { api_version: "apps/v1".into(), kind: "ReplicaSet".into(), name: "rs".into(), uid: Uid::from("rs-1") };
        let r = owner.to_object_ref(Some("prod"));
        assert_eq!(r.namespace.as_deref(), Some("prod"));
        assert_eq!(r.uid, Uid::from("rs-1"));
    }
}
