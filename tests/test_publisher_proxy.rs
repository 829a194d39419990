//! Publisher proxy behavior against the in-process broker
//!
//! Every test drives the proxy only through its public surface and checks
//! what the broker saw.


use busproxy::observability::LinkMetrics;
use busproxy::transport::memory::BrokerEvent;
use busproxy::{ProxyStatus, PublishOutcome, PublisherOptions, PublisherProxy};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{publisher, sender_attaches, sessions_closed, setup, wait_until};

fn options() -> PublisherOptions {
    PublisherOptions::new("telemetry").link_name("telemetry-tx")
}

#[tokio::test]
async fn test_connect_twice_opens_one_session() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    proxy.connect().await;
    let first = proxy.connection_id();
    proxy.connect().await;

    assert!(proxy.is_connected());
    assert_eq!(proxy.connection_id(), first);
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(sender_attaches(&broker), 1);
}

#[tokio::test]
async fn test_disconnect_when_never_connected_is_noop() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    proxy.disconnect().await;
    proxy.disconnect().await;

    assert!(!proxy.is_connected());
    assert_eq!(proxy.status(), ProxyStatus::Disconnected);
    assert_eq!(proxy.connection_id(), None);
    assert_eq!(broker.sessions_opened(), 0);
}

#[tokio::test]
async fn test_disconnect_twice_after_connect_is_noop() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    proxy.connect().await;

    proxy.disconnect().await;
    proxy.disconnect().await;

    assert!(!proxy.is_connected());
    assert_eq!(broker.open_sessions(), 0);
    assert_eq!(sessions_closed(&broker), 1);
}

#[tokio::test]
async fn test_publish_connects_before_sending() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    let outcome = proxy.publish("temp=21.5", None).await;

    assert_eq!(outcome, PublishOutcome::Sent);
    assert!(proxy.is_connected());
    let journal = broker.journal();
    let opened = journal
        .iter()
        .position(|e| matches!(e, BrokerEvent::SessionOpened { .. }))
        .unwrap();
    let published = journal
        .iter()
        .position(|e| matches!(e, BrokerEvent::Published { .. }))
        .unwrap();
    assert!(opened < published);
    assert_eq!(broker.published("telemetry"), vec!["temp=21.5"]);
}

#[tokio::test]
async fn test_send_failure_disconnects_and_next_publish_reconnects() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    proxy.connect().await;
    let before = proxy.connection_id().unwrap();

    broker.fail_sends(true);
    assert_eq!(proxy.publish("lost", None).await, PublishOutcome::Failed);
    assert!(!proxy.is_connected());
    assert_eq!(proxy.connection_id(), None);

    broker.fail_sends(false);
    assert_eq!(proxy.publish("kept", None).await, PublishOutcome::Sent);

    assert!(proxy.is_connected());
    assert_ne!(proxy.connection_id(), Some(before));
    assert_eq!(broker.sessions_opened(), 2);
    assert_eq!(broker.published("telemetry"), vec!["kept"]);
}

#[tokio::test]
async fn test_empty_payload_skips_send() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    let outcome = proxy.publish(Vec::<u8>::new(), None).await;

    assert_eq!(outcome, PublishOutcome::Skipped);
    assert!(proxy.is_connected());
    assert_eq!(broker.sessions_opened(), 1);
    assert!(broker.published("telemetry").is_empty());
}

#[tokio::test]
async fn test_empty_payload_still_closes_after_send() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options().close_after_send(true));

    assert_eq!(proxy.publish("", None).await, PublishOutcome::Skipped);

    assert!(!proxy.is_connected());
    assert!(broker.published("telemetry").is_empty());
    assert_eq!(sessions_closed(&broker), 1);
}

#[tokio::test]
async fn test_close_after_send_uses_fresh_connection_per_publish() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options().close_after_send(true));

    assert_eq!(proxy.publish("one", None).await, PublishOutcome::Sent);
    assert!(!proxy.is_connected());
    assert_eq!(proxy.publish("two", None).await, PublishOutcome::Sent);

    assert_eq!(broker.sessions_opened(), 2);
    assert_eq!(broker.open_sessions(), 0);
    assert_eq!(broker.published("telemetry"), vec!["one", "two"]);
}

#[tokio::test]
async fn test_reconnect_issues_new_connection_id() {
    let (_broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    proxy.connect().await;
    let first = proxy.connection_id().unwrap();
    proxy.disconnect().await;
    proxy.connect().await;
    let second = proxy.connection_id().unwrap();

    assert_ne!(first, second);
}

#[tokio::test]
async fn test_reuse_scenario_with_out_of_band_close() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options().reuse_existing_connection(true));

    proxy.connect().await;
    let connection_a = proxy.connection_id().unwrap();
    proxy.disconnect().await;

    proxy.connect().await;
    let connection_b = proxy.connection_id().unwrap();
    assert_ne!(connection_a, connection_b);

    assert_eq!(proxy.publish(vec![1u8, 2, 3], None).await, PublishOutcome::Sent);
    assert!(proxy.is_connected());

    assert_eq!(broker.drop_sessions("broker restarted"), 1);

    assert!(!proxy.is_connected());
    assert_eq!(proxy.connection_id(), None);
}

#[tokio::test]
async fn test_publish_after_out_of_band_close_reconnects() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    proxy.publish("before", None).await;

    broker.drop_sessions("network partition");
    let outcome = proxy.publish("after", None).await;

    assert_eq!(outcome, PublishOutcome::Sent);
    assert!(proxy.is_connected());
    assert_eq!(broker.sessions_opened(), 2);
    assert_eq!(broker.published("telemetry"), vec!["before", "after"]);
}

#[tokio::test]
async fn test_refused_connection_drops_message() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    broker.refuse_connections(true);

    assert_eq!(proxy.publish("nobody home", None).await, PublishOutcome::Dropped);
    assert!(!proxy.is_connected());
    assert_eq!(proxy.status(), ProxyStatus::Disconnected);
    assert_eq!(proxy.metrics().snapshot().messages_dropped, 1);
    assert_eq!(proxy.metrics().snapshot().connect_failures, 1);

    broker.refuse_connections(false);
    assert_eq!(proxy.publish("back", None).await, PublishOutcome::Sent);
}

#[tokio::test]
async fn test_link_attach_failure_releases_connection() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    broker.fail_link_attach(true);

    assert_eq!(proxy.publish("x", None).await, PublishOutcome::Dropped);

    assert!(!proxy.is_connected());
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_stalled_send_times_out_and_disconnects() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(
        &factory,
        options().send_timeout(Duration::from_millis(50)),
    );
    proxy.connect().await;
    broker.set_send_delay(Some(Duration::from_millis(500)));

    let outcome = proxy.publish("slow", None).await;

    assert_eq!(outcome, PublishOutcome::Failed);
    assert!(!proxy.is_connected());
    assert_eq!(proxy.metrics().snapshot().publish_failures, 1);
}

#[tokio::test]
async fn test_durability_default_and_override() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options().durable(true));

    proxy.publish("a", None).await;
    proxy.publish("b", Some(false)).await;
    proxy.set_durable(false);
    proxy.publish("c", None).await;

    assert_eq!(broker.published_durability("telemetry"), vec![true, false, false]);
}

#[tokio::test]
async fn test_reuses_injected_live_connection() {
    let (broker, factory) = setup("telemetry");
    let connection = factory.build_connection(factory.address());
    connection.connect().await;
    let injected_id = connection.id().unwrap();

    let proxy = PublisherProxy::with_connection(
        Arc::clone(&factory),
        options().reuse_existing_connection(true),
        connection.clone(),
    )
    .unwrap();
    assert_eq!(proxy.publish("shared", None).await, PublishOutcome::Sent);

    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(proxy.connection_id(), Some(injected_id));
}

#[tokio::test]
async fn test_injected_connection_replaced_without_reuse() {
    let (broker, factory) = setup("telemetry");
    let connection = factory.build_connection(factory.address());
    connection.connect().await;

    let proxy =
        PublisherProxy::with_connection(Arc::clone(&factory), options(), connection.clone()).unwrap();
    proxy.connect().await;

    assert_eq!(broker.sessions_opened(), 2);
    assert!(!connection.is_live());
    assert_ne!(proxy.connection_id(), connection.id());
}

#[tokio::test]
async fn test_dead_injected_connection_not_reused() {
    let (broker, factory) = setup("telemetry");
    let connection = factory.build_connection(factory.address());
    connection.connect().await;
    let injected_id = connection.id().unwrap();
    broker.drop_sessions("gone before use");

    let proxy = PublisherProxy::with_connection(
        Arc::clone(&factory),
        options().reuse_existing_connection(true),
        connection,
    )
    .unwrap();
    proxy.connect().await;

    assert!(proxy.is_connected());
    assert_ne!(proxy.connection_id(), Some(injected_id));
    assert_eq!(broker.sessions_opened(), 2);
}

#[tokio::test]
async fn test_stale_close_signal_ignored() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    proxy.connect().await;
    let stale_signals = broker.close_signals();

    proxy.disconnect().await;
    proxy.connect().await;
    let current = proxy.connection_id();
    for signal in stale_signals {
        signal.closed("late notification");
    }

    assert!(proxy.is_connected());
    assert_eq!(proxy.connection_id(), current);
}

#[tokio::test]
async fn test_concurrent_publishes_share_one_connection() {
    let (broker, factory) = setup("telemetry");
    let proxy = Arc::new(publisher(&factory, options()));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.publish(format!("m{i}"), None).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), PublishOutcome::Sent);
    }

    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.published("telemetry").len(), 10);
}

#[tokio::test]
async fn test_concurrent_first_use_connects_once() {
    let (broker, factory) = setup("telemetry");
    broker.set_open_delay(Some(Duration::from_millis(20)));
    let proxy = publisher(&factory, options());

    let outcomes = futures::future::join_all(
        (0..5).map(|i| proxy.publish(format!("burst-{i}"), None)),
    )
    .await;

    assert!(outcomes.iter().all(|o| *o == PublishOutcome::Sent));
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(sender_attaches(&broker), 1);
}

#[tokio::test]
async fn test_status_watch_follows_lifecycle() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());
    let mut status = proxy.watch_status();

    proxy.connect().await;
    let connected = *status.borrow_and_update();
    assert!(matches!(connected, ProxyStatus::Connected { .. }));
    assert_eq!(connected.connection_id(), proxy.connection_id());

    broker.drop_sessions("lost");
    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), ProxyStatus::Disconnected);

    // Teardown runs on a spawned task; the broker-side link closes shortly after
    assert!(
        wait_until(Duration::from_secs(1), || {
            broker
                .journal()
                .iter()
                .any(|e| matches!(e, BrokerEvent::LinkClosed { link } if link == "telemetry-tx"))
        })
        .await
    );
}

#[tokio::test]
async fn test_metrics_track_outcomes() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    proxy.publish("a", None).await;
    proxy.publish("", None).await;
    broker.fail_sends(true);
    proxy.publish("b", None).await;

    let snapshot = proxy.metrics().snapshot();
    assert_eq!(snapshot.messages_published, 1);
    assert_eq!(snapshot.messages_skipped, 1);
    assert_eq!(snapshot.publish_failures, 1);
    assert_eq!(snapshot.connections_established, 1);
    assert!(!snapshot.connected);
}

#[tokio::test]
async fn test_reconnect_after_out_of_band_close_is_counted() {
    let (broker, factory) = setup("telemetry");
    let proxy = publisher(&factory, options());

    proxy.publish("before", None).await;
    assert_eq!(proxy.metrics().snapshot().reconnects, 0);

    broker.drop_sessions("broker restart");
    proxy.publish("after", None).await;

    let snapshot = proxy.metrics().snapshot();
    assert_eq!(snapshot.connections_established, 2);
    assert_eq!(snapshot.reconnects, 1);
    assert!(snapshot.connected);
}

#[tokio::test]
async fn test_proxies_share_injected_metrics() {
    let (_broker, factory) = setup("telemetry");
    let shared = Arc::new(LinkMetrics::new());
    let first = publisher(&factory, options().metrics(Arc::clone(&shared)));
    let second = publisher(
        &factory,
        PublisherOptions::new("telemetry")
            .link_name("telemetry-tx-2")
            .metrics(Arc::clone(&shared)),
    );

    first.publish("a", None).await;
    second.publish("b", None).await;
    second.publish("", None).await;

    assert!(Arc::ptr_eq(&first.metrics(), &shared));
    let snapshot = shared.snapshot();
    assert_eq!(snapshot.messages_published, 2);
    assert_eq!(snapshot.messages_skipped, 1);
    assert_eq!(snapshot.connections_established, 2);
}

#[tokio::test]
async fn test_adopter_notices_disconnect_by_other_holder() {
    let (broker, factory) = setup("telemetry");
    let connection = factory.build_connection(factory.address());
    connection.connect().await;

    let first = PublisherProxy::with_connection(
        Arc::clone(&factory),
        options().reuse_existing_connection(true),
        connection.clone(),
    )
    .unwrap();
    let second = PublisherProxy::with_connection(
        Arc::clone(&factory),
        PublisherOptions::new("telemetry")
            .link_name("telemetry-tx-2")
            .reuse_existing_connection(true),
        connection.clone(),
    )
    .unwrap();
    first.connect().await;
    second.connect().await;
    assert_eq!(broker.sessions_opened(), 1);

    let mut status = second.watch_status();
    let _ = status.borrow_and_update();
    first.disconnect().await;

    assert!(status.has_changed().unwrap());
    assert_eq!(*status.borrow_and_update(), ProxyStatus::Disconnected);
    assert!(!second.is_connected());

    assert_eq!(second.publish("again", None).await, PublishOutcome::Sent);
    assert!(second.is_connected());
    assert_eq!(broker.sessions_opened(), 2);
}

#[test]
fn test_invalid_options_rejected() {
    let (_broker, factory) = setup("telemetry");

    assert!(PublisherProxy::new(Arc::clone(&factory), PublisherOptions::new("")).is_err());
    assert!(
        PublisherProxy::new(factory, PublisherOptions::new("t").link_name(" ")).is_err()
    );
}
