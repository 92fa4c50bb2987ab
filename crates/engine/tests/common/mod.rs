#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kdisco_core::{Action, ConsumerKey, DesiredState, ObjectKind, Uid, WatchSpec};
use kdisco_engine::fake::FakeCluster;
use kdisco_engine::{Engine, EngineConfig};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

pub struct Fixture {
    pub fake: Arc<FakeCluster>,
    pub engine: Engine,
    pub rx: mpsc::UnboundedReceiver<Action>,
}

impl Fixture {
    pub fn new(kind: ObjectKind) -> Self { Self::with_config(EngineConfig::for_kind(kind).with_events_since(0)) }

    pub fn with_config(cfg: EngineConfig) -> Self {
        let fake = FakeCluster::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(cfg, fake.clone(), fake.clone(), Arc::new(tx));
        Self { fake, engine, rx }
    }

    pub async fn next_action(&mut self) -> Action {
        tokio::time::timeout(WAIT, self.rx.recv()).await.expect("timed out waiting for action").expect("dispatch channel closed")
    }

    pub async fn assert_no_action(&mut self) {
        if let Ok(Some(a)) = tokio::time::timeout(QUIET, self.rx.recv()).await {
            panic!("unexpected action: {a:?}");
        }
    }
}

pub fn desired(entries: &[(&str, WatchSpec)]) -> DesiredState {
    entries.iter().map(|(k, s)| (ConsumerKey::from(*k), s.clone())).collect()
}

/// Wait until the engine has triaged `uid` under `owner`.
pub async fn wait_descendant(engine: &Engine, owner: &str, uid: &str) {
    let (owner, uid) = (Uid::from(owner), Uid::from(uid));
    let deadline = tokio::time::Instant::now() + WAIT;
    while !engine.descendants(&owner).await.contains(&uid) {
        assert!(tokio::time::Instant::now() < deadline, "{uid} never recorded under {owner}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the engine caches `uid` at `resource_version`.
pub async fn wait_known(engine: &Engine, uid: &str, resource_version: &str) {
    let uid = Uid::from(uid);
    let deadline = tokio::time::Instant::now() + WAIT;
    while engine.known_object(&uid).await.map_or(true, |o| o.resource_version != resource_version) {
        assert!(tokio::time::Instant::now() < deadline, "{uid}@{resource_version} never cached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Unpack a `Changed` action as `(consumer, object name, ancestor)`.
pub fn changed(action: Action) -> (String, String, Option<String>) {
    match action {
        Action::Changed { consumer, object, ancestor } => (consumer.0, object.name.clone(), ancestor.map(|u| u.0)),
        other => panic!("expected Changed, got {other:?}"),
    }
}
