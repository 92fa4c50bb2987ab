//! Owner-tree resolution against the API server, memoized per UID.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use kdisco_core::{ClientError, ObjectRef, OwnerFetcher, OwnerReference, OwnerTree, Uid};
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::client_error;
use crate::convert::{creation_ts, gvk_of, owner_refs};

/// Deeper chains are cut off with a leaf.
pub const MAX_OWNER_DEPTH: usize = 32;

/// The parts of an object an owner walk needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct OwnerMeta {
    pub creation_ts: i64,
    pub owners: Vec<OwnerReference>,
}

#[async_trait::async_trait]
pub(crate) trait OwnerSource: Send + Sync {
    /// `None` when the object is gone or was replaced by a new one with the same name.
    async fn owner_meta(&self, subject: &ObjectRef) -> Result<Option<OwnerMeta>, ClientError>;
}

struct ApiOwnerSource {
    client: Client,
}

#[async_trait::async_trait]
impl OwnerSource for ApiOwnerSource {
    async fn owner_meta(&self, subject: &ObjectRef) -> Result<Option<OwnerMeta>, ClientError> {
        let ar = ApiResource::from_gvk(&gvk_of(subject)?);
        let api: Api<DynamicObject> = match subject.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        match api.get_opt(&subject.name).await {
            Ok(Some(obj)) if obj.metadata.uid.as_deref() == Some(subject.uid.as_str()) => {
                Ok(Some(OwnerMeta { creation_ts: creation_ts(&obj), owners: owner_refs(&obj).collect() }))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                counter!("kdisco_owner_fetch_errors_total", 1u64);
                Err(client_error(e))
            }
        }
    }
}

enum Slot {
    Ready(OwnerTree),
    Resolving,
}

enum Lookup<'a> {
    Cached(OwnerTree),
    Reserved(Reservation<'a>),
    /// Another lookup is resolving this UID right now.
    Busy,
}

/// Marks a UID as being resolved; dropping it unfinished frees the slot for a retry.
struct Reservation<'a> {
    memo: &'a Mutex<FxHashMap<Uid, Slot>>,
    uid: Uid,
    done: bool,
}

impl Reservation<'_> {
    fn complete(mut self, tree: OwnerTree) {
        lock(self.memo).insert(self.uid.clone(), Slot::Ready(tree));
        self.done = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut memo = lock(self.memo);
        if matches!(memo.get(&self.uid), Some(Slot::Resolving)) {
            memo.remove(&self.uid);
        }
    }
}

fn lock(memo: &Mutex<FxHashMap<Uid, Slot>>) -> MutexGuard<'_, FxHashMap<Uid, Slot>> {
    memo.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves `ownerReferences` chains with `GET`s on each owner.
///
/// Owner references are immutable, so a resolved tree is cached for the life of the
/// process. Failed lookups are not cached and the next caller retries. A lookup never
/// waits on a UID another lookup is resolving; it fetches that owner itself instead.
pub struct KubeOwnerFetcher {
    source: Box<dyn OwnerSource>,
    memo: Mutex<FxHashMap<Uid, Slot>>,
}

impl KubeOwnerFetcher {
    pub fn new(client: Client) -> Self { Self::with_source(Box::new(ApiOwnerSource { client })) }

    pub(crate) fn with_source(source: Box<dyn OwnerSource>) -> Self { Self { source, memo: Mutex::new(FxHashMap::default()) } }

    fn reserve(&self, uid: &Uid) -> Lookup<'_> {
        let mut memo = lock(&self.memo);
        match memo.get(uid) {
            Some(Slot::Ready(tree)) => Lookup::Cached(tree.clone()),
            Some(Slot::Resolving) => Lookup::Busy,
            None => {
                memo.insert(uid.clone(), Slot::Resolving);
                Lookup::Reserved(Reservation { memo: &self.memo, uid: uid.clone(), done: false })
            }
        }
    }

    fn tree_of<'a>(&'a self, subject: &'a ObjectRef, path: Vec<Uid>) -> BoxFuture<'a, Result<OwnerTree, ClientError>> {
        async move {
            if subject.uid.is_empty() {
                return Err(ClientError::MissingUid(subject.name.clone()));
            }
            if path.contains(&subject.uid) {
                debug!(uid = %subject.uid, "ownerReferences cycle; truncating");
                return Ok(OwnerTree::leaf(subject.clone()));
            }
            if path.len() >= MAX_OWNER_DEPTH {
                debug!(uid = %subject.uid, depth = path.len(), "owner chain too deep; truncating");
                return Ok(OwnerTree::leaf(subject.clone()));
            }
            match self.reserve(&subject.uid) {
                Lookup::Cached(tree) => Ok(tree),
                Lookup::Reserved(slot) => {
                    let tree = self.fetch(subject, path).await?;
                    slot.complete(tree.clone());
                    Ok(tree)
                }
                Lookup::Busy => {
                    trace!(uid = %subject.uid, "owner lookup already in flight; fetching uncached");
                    self.fetch(subject, path).await
                }
            }
        }
        .boxed()
    }

    async fn fetch(&self, subject: &ObjectRef, mut path: Vec<Uid>) -> Result<OwnerTree, ClientError> {
        let mut tree = OwnerTree::leaf(subject.clone());
        let Some(meta) = self.source.owner_meta(subject).await? else {
            trace!(kind = %subject.kind, name = %subject.name, "owner not found; leaf");
            return Ok(tree);
        };
        tree.creation_ts = meta.creation_ts;
        path.push(subject.uid.clone());
        for owner in &meta.owners {
            let owner_ref = owner.to_object_ref(subject.namespace.as_deref());
            tree.owners.push(self.tree_of(&owner_ref, path.clone()).await?);
        }
        Ok(tree)
    }
}

#[async_trait::async_trait]
impl OwnerFetcher for KubeOwnerFetcher {
    async fn resolve_owner_tree(&self, subject: &ObjectRef) -> Result<OwnerTree, ClientError> {
        self.tree_of(subject, Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use rustc_hash::FxHashSet;

    use super::*;

    #[derive(Default)]
    struct MapSource {
        objects: FxHashMap<Uid, OwnerMeta>,
        failing: Mutex<FxHashSet<Uid>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl MapSource {
        fn owned_by(mut self, uid: &str, owners: &[&str]) -> Self {
            let owners = owners
                .iter()
                .map(|o| OwnerReference { api_version: "v1".into(), kind: "Thing".into(), name: o.to_string(), uid: Uid::from(*o) })
                .collect();
            self.objects.insert(Uid::from(uid), OwnerMeta { creation_ts: 0, owners });
            self
        }
    }

    #[async_trait::async_trait]
    impl OwnerSource for Arc<MapSource> {
        async fn owner_meta(&self, subject: &ObjectRef) -> Result<Option<OwnerMeta>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.failing.lock().unwrap().remove(&subject.uid) {
                return Err(ClientError::Transport("connection reset".into()));
            }
            Ok(self.objects.get(&subject.uid).cloned())
        }
    }

    fn subject(uid: &str) -> ObjectRef {
        ObjectRef { api_version: "v1".into(), kind: "Thing".into(), namespace: Some("default".into()), name: uid.into(), uid: Uid::from(uid) }
    }

    fn fetcher(source: &Arc<MapSource>) -> KubeOwnerFetcher { KubeOwnerFetcher::with_source(Box::new(Arc::clone(source))) }

    #[tokio::test]
    async fn opposite_ends_of_a_cycle_resolve_concurrently() {
        let mut source = MapSource::default().owned_by("a", &["b"]).owned_by("b", &["a"]);
        source.delay = Some(Duration::from_millis(20));
        let source = Arc::new(source);
        let f = fetcher(&source);

        let (a, b) = (subject("a"), subject("b"));
        let both = async { tokio::join!(f.resolve_owner_tree(&a), f.resolve_owner_tree(&b)) };
        let (ta, tb) = tokio::time::timeout(Duration::from_secs(2), both).await.expect("lookups stalled");
        let (ta, tb) = (ta.unwrap(), tb.unwrap());

        assert_eq!(ta.owners[0].reference.uid, Uid::from("b"));
        assert_eq!(ta.owners[0].owners[0].reference.uid, Uid::from("a"));
        assert!(ta.owners[0].owners[0].owners.is_empty());
        assert_eq!(tb.owners[0].reference.uid, Uid::from("a"));
        assert!(tb.owners[0].owners[0].owners.is_empty());
    }

    #[tokio::test]
    async fn shared_owners_are_fetched_once() {
        let source = Arc::new(MapSource::default().owned_by("pod-1", &["rs"]).owned_by("pod-2", &["rs"]).owned_by("rs", &["dep"]).owned_by("dep", &[]));
        let f = fetcher(&source);

        let t1 = f.resolve_owner_tree(&subject("pod-1")).await.unwrap();
        let t2 = f.resolve_owner_tree(&subject("pod-2")).await.unwrap();
        assert_eq!(t1.owners[0], t2.owners[0]);
        assert_eq!(t2.owners[0].owners[0].reference.uid, Uid::from("dep"));
        // pod-1, rs, dep, pod-2
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_owner_is_retried_by_the_next_lookup() {
        let source = Arc::new(MapSource::default().owned_by("pod-1", &["rs"]).owned_by("rs", &[]));
        source.failing.lock().unwrap().insert(Uid::from("rs"));
        let f = fetcher(&source);

        assert!(matches!(f.resolve_owner_tree(&subject("pod-1")).await, Err(ClientError::Transport(_))));
        let tree = f.resolve_owner_tree(&subject("pod-1")).await.unwrap();
        assert_eq!(tree.owners[0].reference.uid, Uid::from("rs"));
    }

    #[tokio::test]
    async fn long_chains_are_truncated() {
        let mut source = MapSource::default();
        for i in 0..(MAX_OWNER_DEPTH * 2) {
            source = source.owned_by(&format!("u{i}"), &[&format!("u{}", i + 1)]);
        }
        let f = fetcher(&Arc::new(source));

        let mut node = f.resolve_owner_tree(&subject("u0")).await.unwrap();
        let mut depth = 0;
        while let Some(next) = node.owners.pop() {
            node = next;
            depth += 1;
        }
        assert_eq!(depth, MAX_OWNER_DEPTH);
    }

    #[tokio::test]
    async fn missing_uid_is_rejected() {
        let f = fetcher(&Arc::new(MapSource::default()));
        let mut s = subject("x");
        s.uid = Uid::default();
        assert!(matches!(f.resolve_owner_tree(&s).await, Err(ClientError::MissingUid(_))));
    }
}
