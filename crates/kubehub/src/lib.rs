//! kdisco kubehub: kube-rs backed [`ClusterClient`] and [`OwnerFetcher`](kdisco_core::OwnerFetcher).

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use futures::StreamExt;
use kdisco_core::{ClientError, ClusterClient, Namespace, ObjectKind, ObjectUpdate, WatchedObject};
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod convert;
mod owners;

pub use owners::KubeOwnerFetcher;

pub const DEFAULT_WATCH_BUFFER: usize = 1024;

pub async fn get_kube_client() -> Result<Client, ClientError> { Client::try_default().await.map_err(client_error) }

pub(crate) fn client_error(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(resp) => ClientError::Api { code: resp.code, message: resp.message },
        other => ClientError::Transport(other.to_string()),
    }
}

fn watch_buffer_from_env() -> usize {
    std::env::var("KDISCO_WATCH_BUFFER")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WATCH_BUFFER)
}

/// Namespace-scoped list+watch of core/v1 objects.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    buffer: usize,
}

impl KubeClusterClient {
    /// Buffer size comes from `KDISCO_WATCH_BUFFER`, else [`DEFAULT_WATCH_BUFFER`].
    pub fn new(client: Client) -> Self { Self { client, buffer: watch_buffer_from_env() } }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    fn api(&self, kind: ObjectKind, ns: &Namespace) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", kind.k8s_kind()));
        Api::namespaced_with(self.client.clone(), ns.as_str(), &ar)
    }

    /// Fetch one object by name; `None` if it does not exist.
    pub async fn get(&self, kind: ObjectKind, ns: &Namespace, name: &str) -> Result<Option<WatchedObject>, ClientError> {
        match self.api(kind, ns).get_opt(name).await.map_err(client_error)? {
            Some(obj) => convert::watched_from(kind, &obj).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn watch_namespace(&self, kind: ObjectKind, namespace: &Namespace, cancel: CancellationToken) -> Result<mpsc::Receiver<ObjectUpdate>, ClientError> {
        let api = self.api(kind, namespace);
        // the watcher retries forever, so auth and connectivity are checked up front with a list
        api.list(&ListParams::default().limit(1)).await.map_err(client_error)?;

        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(pump(kind, namespace.clone(), api, tx, cancel));
        info!(kind = %kind, ns = %namespace, buffer = self.buffer, "watcher started");
        Ok(rx)
    }
}

async fn pump(kind: ObjectKind, ns: Namespace, api: Api<DynamicObject>, tx: mpsc::Sender<ObjectUpdate>, cancel: CancellationToken) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut names: BTreeSet<String> = BTreeSet::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(kind = %kind, ns = %ns, "watcher canceled");
                break;
            }
            _ = tx.closed() => {
                debug!(kind = %kind, ns = %ns, "watch receiver dropped");
                break;
            }
            ev = stream.next() => ev,
        };
        let updates = match next {
            Some(Ok(ev)) => updates_from(kind, &ns, ev, &mut names),
            Some(Err(e)) => {
                warn!(kind = %kind, ns = %ns, error = %e, "watch error; backing off");
                counter!("kdisco_watch_stream_errors_total", 1u64, "kind" => kind.as_str());
                continue;
            }
            None => {
                warn!(kind = %kind, ns = %ns, "watcher stream ended");
                break;
            }
        };
        for u in updates {
            if tx.send(u).await.is_err() {
                return;
            }
        }
    }
}

/// Translate one watcher event. `names` tracks what this watch has reported live so a
/// relist can emit tombstones for objects that vanished while disconnected.
fn updates_from(kind: ObjectKind, ns: &Namespace, ev: Event<DynamicObject>, names: &mut BTreeSet<String>) -> Vec<ObjectUpdate> {
    let tombstone = |name: String| ObjectUpdate::Deleted { namespace: ns.clone(), name };
    match ev {
        Event::Applied(o) => upsert(kind, &o, names).into_iter().collect(),
        Event::Deleted(o) => {
            let name = o.metadata.name.clone().unwrap_or_default();
            names.remove(&name);
            vec![tombstone(name)]
        }
        Event::Restarted(list) => {
            debug!(kind = %kind, ns = %ns, count = list.len(), "watch restart");
            let previous = std::mem::take(names);
            let mut out: Vec<ObjectUpdate> = list.iter().filter_map(|o| upsert(kind, o, names)).collect();
            out.extend(previous.difference(names).cloned().map(tombstone));
            out
        }
    }
}

fn upsert(kind: ObjectKind, obj: &DynamicObject, names: &mut BTreeSet<String>) -> Option<ObjectUpdate> {
    match convert::watched_from(kind, obj) {
        Ok(w) => {
            names.insert(w.name.clone());
            Some(ObjectUpdate::Upsert(std::sync::Arc::new(w)))
        }
        Err(e) => {
            warn!(kind = %kind, error = %e, "skipping unconvertible object");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "default", "uid": format!("u-{name}")}
        }))
        .unwrap()
    }

    #[test]
    fn relist_emits_tombstones_for_vanished_objects() {
        let ns = Namespace::from("default");
        let mut names = BTreeSet::new();
        updates_from(ObjectKind::Pod, &ns, Event::Applied(pod("a")), &mut names);
        updates_from(ObjectKind::Pod, &ns, Event::Applied(pod("b")), &mut names);

        let out = updates_from(ObjectKind::Pod, &ns, Event::Restarted(vec![pod("b"), pod("c")]), &mut names);
        let upserts: Vec<_> = out.iter().filter_map(|u| u.as_object()).map(|o| o.name.clone()).collect();
        let deleted: Vec<_> = out.iter().filter_map(|u| u.as_deleted_key()).map(|(_, n)| n.to_string()).collect();
        assert_eq!(upserts, vec!["b", "c"]);
        assert_eq!(deleted, vec!["a"]);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn delete_is_a_tombstone_and_forgets_name() {
        let ns = Namespace::from("default");
        let mut names = BTreeSet::new();
        updates_from(ObjectKind::Pod, &ns, Event::Applied(pod("a")), &mut names);
        let out = updates_from(ObjectKind::Pod, &ns, Event::Deleted(pod("a")), &mut names);
        assert!(matches!(out.as_slice(), [ObjectUpdate::Deleted { name, .. }] if name == "a"));
        assert!(names.is_empty());
    }

    #[test]
    fn api_errors_keep_status_code() {
        let resp = kube::core::ErrorResponse { status: "Failure".into(), message: "forbidden".into(), reason: "Forbidden".into(), code: 403 };
        assert!(matches!(client_error(kube::Error::Api(resp)), ClientError::Api { code: 403, .. }));
    }
}
