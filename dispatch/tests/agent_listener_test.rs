//! AgentListenerActor integration tests against the in-process broker.
//!
//! Every wait is bounded with `tokio::time::timeout`; the transport polls
//! every 20ms so the receive loop reacts quickly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use dispatch::actors::agent_listener::{self, results_queue_name, AgentListenerError};
use dispatch::actors::spawn_agent_listener;
use dispatch::config::Config;
use dispatch::store::Store;
use dispatch::transport::{InMemoryTransport, QueueOptions, Transport};
use dispatch::AppState;

const WAIT: Duration = Duration::from_secs(2);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn transport() -> InMemoryTransport {
    InMemoryTransport::new(Duration::from_millis(20))
}

/// Wait until the listener has declared its queue
async fn wait_for_queue(transport: &InMemoryTransport, queue: &str) {
    timeout(WAIT, async {
        while transport.queue_options(queue).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue declared");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_result_resolves_subscribed_waiter() {
    let transport = transport();
    let listener = spawn_agent_listener("Env-1", Arc::new(transport.clone()), Duration::from_secs(60))
        .await
        .unwrap();
    agent_listener::start(&listener).await.unwrap();

    let waiter = agent_listener::subscribe(&listener, "task-1").await.unwrap();
    let queue = results_queue_name("Env-1");
    transport
        .publish(&queue, json!({"SourceID": "task-1", "Body": {"ok": true}}))
        .await
        .unwrap();

    let body = timeout(WAIT, waiter).await.expect("resolved in time").unwrap();
    assert_eq!(body["Body"]["ok"], true);

    let status = agent_listener::status(&listener).await.unwrap();
    assert_eq!(status.pending, 0);
    listener.stop(None);
}

#[tokio::test]
async fn test_queue_is_declared_ha_with_ttl() {
    let transport = transport();
    let ttl = Duration::from_secs(86_400);
    let listener = spawn_agent_listener("MyEnv", Arc::new(transport.clone()), ttl)
        .await
        .unwrap();
    agent_listener::start(&listener).await.unwrap();

    let queue = "-execution-results-myenv";
    wait_for_queue(&transport, queue).await;
    assert_eq!(
        transport.queue_options(queue),
        Some(QueueOptions {
            ha: true,
            ttl: Some(ttl),
        })
    );
    assert_eq!(agent_listener::status(&listener).await.unwrap().queue_name, queue);
    listener.stop(None);
}

#[tokio::test]
async fn test_second_result_with_same_id_is_dropped() {
    let transport = transport();
    let listener = spawn_agent_listener("env-2", Arc::new(transport.clone()), Duration::from_secs(60))
        .await
        .unwrap();
    agent_listener::start(&listener).await.unwrap();
    let queue = results_queue_name("env-2");

    let waiter = agent_listener::subscribe(&listener, "dup").await.unwrap();
    transport.publish(&queue, json!({"SourceID": "dup", "n": 1})).await.unwrap();
    transport.publish(&queue, json!({"SourceID": "dup", "n": 2})).await.unwrap();

    let body = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(body["n"], 1);

    // Both messages consumed, nothing left waiting, and the id cannot be reused
    timeout(WAIT, async {
        while transport.queue_depth(&queue) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let err = agent_listener::subscribe(&listener, "dup").await.unwrap_err();
    assert_eq!(err, AgentListenerError::DuplicateSubscription("dup".to_string()));
    listener.stop(None);
}

#[tokio::test]
async fn test_unmatched_result_is_dropped() {
    let transport = transport();
    let listener = spawn_agent_listener("env-3", Arc::new(transport.clone()), Duration::from_secs(60))
        .await
        .unwrap();
    agent_listener::start(&listener).await.unwrap();
    let queue = results_queue_name("env-3");
    wait_for_queue(&transport, &queue).await;

    // Arrives before anyone subscribed
    transport.publish(&queue, json!({"SourceID": "early"})).await.unwrap();
    timeout(WAIT, async {
        while transport.queue_depth(&queue) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Let the receive loop hand the message to the actor
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = agent_listener::subscribe(&listener, "early").await.unwrap();
    assert!(timeout(Duration::from_millis(150), waiter).await.is_err());
    listener.stop(None);
}

#[tokio::test]
async fn test_numeric_source_id_is_accepted() {
    let transport = transport();
    let listener = spawn_agent_listener("env-4", Arc::new(transport.clone()), Duration::from_secs(60))
        .await
        .unwrap();
    agent_listener::start(&listener).await.unwrap();
    let queue = results_queue_name("env-4");

    let waiter = agent_listener::subscribe(&listener, "42").await.unwrap();
    transport.publish(&queue, json!({"SourceID": 42})).await.unwrap();
    let body = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(body["SourceID"], 42);
    listener.stop(None);
}

#[tokio::test]
async fn test_stop_leaves_waiters_unresolved() {
    let transport = transport();
    let listener = spawn_agent_listener("env-5", Arc::new(transport.clone()), Duration::from_secs(60))
        .await
        .unwrap();
    agent_listener::start(&listener).await.unwrap();
    let queue = results_queue_name("env-5");
    wait_for_queue(&transport, &queue).await;

    let mut waiter = agent_listener::subscribe(&listener, "late").await.unwrap();
    assert!(agent_listener::stop(&listener).await.unwrap());

    transport.publish(&queue, json!({"SourceID": "late"})).await.unwrap();
    assert!(timeout(Duration::from_millis(150), &mut waiter).await.is_err());

    let status = agent_listener::status(&listener).await.unwrap();
    assert!(!status.running);
    assert_eq!(status.pending, 1);
    assert_eq!(transport.queue_depth(&queue), 1);
    listener.stop(None);
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let transport = transport();
    let listener = spawn_agent_listener("env-6", Arc::new(transport), Duration::from_secs(60))
        .await
        .unwrap();

    assert!(!agent_listener::stop(&listener).await.unwrap());
    assert!(agent_listener::start(&listener).await.unwrap());
    assert!(!agent_listener::start(&listener).await.unwrap());
    assert!(agent_listener::status(&listener).await.unwrap().running);
    assert!(agent_listener::stop(&listener).await.unwrap());
    assert!(!agent_listener::stop(&listener).await.unwrap());
    listener.stop(None);
}

#[tokio::test]
async fn test_duplicate_pending_subscription_is_rejected() {
    let transport = transport();
    let listener = spawn_agent_listener("env-7", Arc::new(transport), Duration::from_secs(60))
        .await
        .unwrap();

    let _waiter = agent_listener::subscribe(&listener, "same").await.unwrap();
    let err = agent_listener::subscribe(&listener, "same").await.unwrap_err();
    assert!(matches!(err, AgentListenerError::DuplicateSubscription(id) if id == "same"));
    listener.stop(None);
}

#[tokio::test]
async fn test_abandoned_waiters_are_pruned() {
    let transport = transport();
    let listener = spawn_agent_listener("env-8", Arc::new(transport), Duration::from_secs(60))
        .await
        .unwrap();

    for n in 0..200 {
        let waiter = agent_listener::subscribe(&listener, format!("gone-{n}")).await.unwrap();
        // Caller gives up and drops its waiter
        assert!(timeout(Duration::from_millis(0), waiter).await.is_err());
    }
    let _kept = agent_listener::subscribe(&listener, "kept").await.unwrap();

    let status = agent_listener::status(&listener).await.unwrap();
    assert_eq!(status.pending, 1);

    // Pruned ids are still never handed out again
    let err = agent_listener::subscribe(&listener, "gone-7").await.unwrap_err();
    assert_eq!(err, AgentListenerError::DuplicateSubscription("gone-7".to_string()));
    listener.stop(None);
}

#[tokio::test]
async fn test_listener_from_app_state_uses_configured_ttl() {
    let transport = transport();
    let config = Config {
        results_queue_ttl: Duration::from_secs(3_600),
        ..Config::default()
    };
    let state = AppState::new(
        config,
        Store::in_memory().await.unwrap(),
        Arc::new(transport.clone()),
    );

    let listener = state.spawn_agent_listener("Env-9").await.unwrap();
    agent_listener::start(&listener).await.unwrap();

    let queue = results_queue_name("Env-9");
    wait_for_queue(&transport, &queue).await;
    assert_eq!(
        transport.queue_options(&queue),
        Some(QueueOptions {
            ha: true,
            ttl: Some(Duration::from_secs(3_600)),
        })
    );
    listener.stop(None);
}
