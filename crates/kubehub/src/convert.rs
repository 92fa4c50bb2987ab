//! DynamicObject -> WatchedObject / OwnerTree conversion.

use k8s_openapi::api::core::v1::ObjectReference as K8sObjectReference;
use kdisco_core::{ClientError, ObjectKind, ObjectRef, OwnerReference, Uid, WatchedObject};
use kube::core::{DynamicObject, GroupVersionKind};

pub(crate) fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Split `apps/v1` into group `apps` and version `v1`; core `v1` has an empty group.
pub(crate) fn parse_api_version(api_version: &str) -> Result<(String, String), ClientError> {
    let parts: Vec<_> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok((String::new(), (*version).to_string())),
        [group, version] if !group.is_empty() && !version.is_empty() => Ok(((*group).to_string(), (*version).to_string())),
        _ => Err(ClientError::InvalidApiVersion(api_version.to_string())),
    }
}

pub(crate) fn gvk_of(r: &ObjectRef) -> Result<GroupVersionKind, ClientError> {
    let (group, version) = parse_api_version(&r.api_version)?;
    Ok(GroupVersionKind::gvk(&group, &version, &r.kind))
}

pub(crate) fn creation_ts(obj: &DynamicObject) -> i64 {
    obj.metadata.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0)
}

pub(crate) fn owner_refs(obj: &DynamicObject) -> impl Iterator<Item = OwnerReference> + '_ {
    obj.metadata.owner_references.iter().flatten().map(|o| OwnerReference {
        api_version: o.api_version.clone(),
        kind: o.kind.clone(),
        name: o.name.clone(),
        uid: Uid::from(o.uid.as_str()),
    })
}

fn involved_object(obj: &DynamicObject) -> Option<ObjectRef> {
    let raw = obj.data.get("involvedObject")?;
    let r: K8sObjectReference = serde_json::from_value(raw.clone()).ok()?;
    Some(ObjectRef {
        api_version: r.api_version.unwrap_or_else(|| "v1".to_string()),
        kind: r.kind.unwrap_or_default(),
        namespace: r.namespace,
        name: r.name.unwrap_or_default(),
        uid: Uid::from(r.uid.unwrap_or_default()),
    })
}

pub(crate) fn watched_from(kind: ObjectKind, obj: &DynamicObject) -> Result<WatchedObject, ClientError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let uid = obj.metadata.uid.as_deref().filter(|u| !u.is_empty()).ok_or_else(|| ClientError::MissingUid(name.clone()))?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();

    let mut out = WatchedObject::new(kind, uid, namespace, name);
    out.resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
    out.creation_ts = creation_ts(obj);
    out.labels = obj.metadata.labels.iter().flatten().map(|(k, v)| (k.clone(), v.clone())).collect();
    out.owners = owner_refs(obj).collect();
    if kind == ObjectKind::Event {
        out.involved = involved_object(obj);
        out.event_type = obj.data.get("type").and_then(|v| v.as_str()).map(str::to_string);
    }
    let mut raw = serde_json::to_value(obj).map_err(|e| ClientError::Other(e.into()))?;
    strip_managed_fields(&mut raw);
    out.raw = raw;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(v: serde_json::Value) -> DynamicObject { serde_json::from_value(v).unwrap() }

    #[test]
    fn api_version_parsing() {
        assert_eq!(parse_api_version("v1").unwrap(), (String::new(), "v1".to_string()));
        assert_eq!(parse_api_version("apps/v1").unwrap(), ("apps".to_string(), "v1".to_string()));
        assert!(matches!(parse_api_version("a/b/c"), Err(ClientError::InvalidApiVersion(_))));
        assert!(parse_api_version("").is_err());
    }

    #[test]
    fn pod_conversion_keeps_owners_and_labels() {
        let obj = dynamic(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "pod-a",
                "namespace": "default",
                "uid": "u-pod",
                "resourceVersion": "42",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "labels": {"app": "web"},
                "managedFields": [{"manager": "kubectl"}],
                "ownerReferences": [{"apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "rs-1", "uid": "u-rs"}]
            },
            "spec": {}
        }));
        let w = watched_from(ObjectKind::Pod, &obj).unwrap();
        assert_eq!(w.uid.as_str(), "u-pod");
        assert_eq!(w.key(), "default/pod-a");
        assert_eq!(w.resource_version, "42");
        assert_eq!(w.creation_ts, 1_704_067_200);
        assert_eq!(w.label("app"), Some("web"));
        assert_eq!(w.owners[0].uid.as_str(), "u-rs");
        assert!(w.raw["metadata"].get("managedFields").is_none());
        assert!(w.involved.is_none());
    }

    #[test]
    fn event_conversion_reads_involved_object() {
        let obj = dynamic(json!({
            "apiVersion": "v1",
            "kind": "Event",
            "metadata": {"name": "pod-a.17f", "namespace": "default", "uid": "u-ev"},
            "involvedObject": {"kind": "Pod", "name": "pod-a", "namespace": "default", "uid": "u-pod"},
            "type": "Warning",
            "reason": "BackOff"
        }));
        let w = watched_from(ObjectKind::Event, &obj).unwrap();
        assert_eq!(w.event_type.as_deref(), Some("Warning"));
        let inv = w.involved.clone().unwrap();
        assert_eq!((inv.api_version.as_str(), inv.kind.as_str(), inv.uid.as_str()), ("v1", "Pod", "u-pod"));
        assert_eq!(w.owner_subject().uid.as_str(), "u-pod");
    }

    #[test]
    fn missing_uid_is_rejected() {
        let obj = dynamic(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "ghost"}}));
        assert!(matches!(watched_from(ObjectKind::Pod, &obj), Err(ClientError::MissingUid(n)) if n == "ghost"));
    }
}
