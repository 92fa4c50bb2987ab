mod common;

use common::{changed, desired, Fixture};
use kdisco_core::{Action, ConsumerKey, Namespace, ObjectKind, Uid, WatchSpec};
use kdisco_engine::fake::pod;

#[tokio::test]
async fn namespace_watch_is_shared_and_refcounted() {
    let fx = Fixture::new(ObjectKind::Pod);
    let ns = Namespace::from("default");
    let a = ("a", WatchSpec::default().namespace("default"));
    let b = ("b", WatchSpec::default().namespace("default"));

    let summary = fx.engine.reconcile(&desired(&[a.clone(), b.clone()])).await;
    assert_eq!(summary.watches_started, 1);
    assert_eq!(fx.fake.watch_calls("default"), 1);
    assert!(fx.engine.has_namespace_watch(&ns, &ConsumerKey::from("a")).await);
    assert!(fx.engine.has_namespace_watch(&ns, &ConsumerKey::from("b")).await);

    let summary = fx.engine.reconcile(&desired(&[b])).await;
    assert_eq!(summary.watches_canceled, 0);
    assert!(!fx.engine.has_namespace_watch(&ns, &ConsumerKey::from("a")).await);
    assert_eq!(fx.fake.live_watches(ObjectKind::Pod, "default"), 1);

    let summary = fx.engine.reconcile(&desired(&[])).await;
    assert_eq!(summary.watches_canceled, 1);
    assert!(fx.engine.watched_namespaces().await.is_empty());
    assert_eq!(fx.fake.live_watches(ObjectKind::Pod, "default"), 0);
}

#[tokio::test]
async fn removed_consumer_releases_claims_and_watch() {
    let mut fx = Fixture::new(ObjectKind::Pod);
    fx.engine
        .reconcile(&desired(&[("server", WatchSpec::default().uid("default", "dep-1").namespace("kube-system"))]))
        .await;
    assert_eq!(fx.engine.claimant(&Uid::from("dep-1")).await, Some(ConsumerKey::from("server")));

    let summary = fx.engine.reconcile(&desired(&[])).await;
    assert_eq!(summary.claims_released, 1);
    assert_eq!(summary.watches_canceled, 2);
    assert_eq!(fx.engine.claimant(&Uid::from("dep-1")).await, None);
    assert_eq!(fx.fake.live_watches(ObjectKind::Pod, "default"), 0);
    assert_eq!(fx.fake.live_watches(ObjectKind::Pod, "kube-system"), 0);

    assert_eq!(fx.fake.emit_object(pod("default", "pod-a", None)).await, 0);
    fx.assert_no_action().await;
}

#[tokio::test]
async fn failed_watch_is_reported_and_retried_next_pass() {
    let mut fx = Fixture::new(ObjectKind::Pod);
    let state = desired(&[
        ("fe", WatchSpec::default().namespace("default")),
        ("fe2", WatchSpec::default().namespace("default")),
    ]);
    fx.fake.fail_watches("default", true);

    let summary = fx.engine.reconcile(&state).await;
    assert_eq!(summary.errors.len(), 1, "one attempt per namespace per pass");
    assert_eq!(fx.fake.watch_calls("default"), 1);
    match fx.next_action().await {
        Action::WatchError { kind, namespace, message } => {
            assert_eq!(kind, ObjectKind::Pod);
            assert_eq!(namespace.as_str(), "default");
            assert!(message.contains("kubectl get pods -n \"default\""), "{message}");
        }
        other => panic!("expected WatchError, got {other:?}"),
    }
    fx.assert_no_action().await;
    assert!(fx.engine.watched_namespaces().await.is_empty());

    fx.fake.fail_watches("default", false);
    let summary = fx.engine.reconcile(&state).await;
    assert!(summary.errors.is_empty());
    assert_eq!(summary.watches_started, 1);
    assert_eq!(fx.fake.watch_calls("default"), 2);
    assert!(fx.engine.has_namespace_watch(&Namespace::from("default"), &ConsumerKey::from("fe2")).await);
}

#[tokio::test]
async fn watch_failure_in_one_namespace_does_not_block_others() {
    let fx = Fixture::new(ObjectKind::Pod);
    fx.fake.fail_watches("broken", true);
    let summary = fx
        .engine
        .reconcile(&desired(&[("fe", WatchSpec::default().namespace("broken").namespace("default"))]))
        .await;
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(fx.engine.watched_namespaces().await, vec![Namespace::from("default")]);
}

#[tokio::test]
async fn server_closed_watch_stays_registered() {
    let mut fx = Fixture::new(ObjectKind::Pod);
    let state = desired(&[("fe", WatchSpec::default().uid("default", "pod-a"))]);
    fx.engine.reconcile(&state).await;
    fx.fake.emit_object(pod("default", "pod-a", None)).await;
    changed(fx.next_action().await);

    fx.fake.close_watches(ObjectKind::Pod, "default");
    assert_eq!(fx.fake.emit_object(pod("default", "pod-a", None)).await, 0);
    fx.assert_no_action().await;

    // the entry survives the closed channel, so reconcile does not reopen it
    let summary = fx.engine.reconcile(&state).await;
    assert!(summary.is_noop(), "{summary:?}");
    assert_eq!(fx.fake.watch_calls("default"), 1);
    assert_eq!(fx.engine.watched_namespaces().await, vec![Namespace::from("default")]);
}

#[tokio::test]
async fn shutdown_cancels_watches_and_ignores_later_reconciles() {
    let fx = Fixture::new(ObjectKind::Service);
    let state = desired(&[("fe", WatchSpec::default().namespace("default"))]);
    fx.engine.reconcile(&state).await;
    assert_eq!(fx.fake.live_watches(ObjectKind::Service, "default"), 1);

    fx.engine.shutdown().await;
    assert_eq!(fx.fake.live_watches(ObjectKind::Service, "default"), 0);
    assert!(fx.engine.watched_namespaces().await.is_empty());

    let summary = fx.engine.reconcile(&state).await;
    assert!(summary.is_noop());
    assert_eq!(fx.fake.watch_calls("default"), 1);
}
