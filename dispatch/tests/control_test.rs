//! Deploying sessions: state transition, deployment record, task dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use dispatch::config::Config;
use dispatch::control::{deploy_session, ControlError};
use dispatch::rpc::{RpcRequest, METHOD_HANDLE_TASK};
use dispatch::store::Store;
use dispatch::transport::{
    InMemoryTransport, QueueHandle, QueueOptions, Transport, TransportError,
};
use dispatch::AppState;
use shared_types::{Environment, Session, SessionState};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn setup() -> (AppState, InMemoryTransport, Environment) {
    let transport = InMemoryTransport::new(Duration::from_millis(20));
    let store = Store::in_memory().await.unwrap();
    let state = AppState::new(Config::default(), store, Arc::new(transport.clone()));

    let env = Environment::new("web", Some("tenant-1".to_string()));
    state.store().create_environment(&env).await.unwrap();
    (state, transport, env)
}

async fn open_session(state: &AppState, env: &Environment) -> Session {
    let session = Session::open(env, "user-1");
    state.store().create_session(&session).await.unwrap();
    session
}

/// Broker that refuses every message
struct UnreachableBroker;

#[async_trait]
impl Transport for UnreachableBroker {
    async fn declare_queue(&self, name: &str, _: QueueOptions) -> Result<(), TransportError> {
        Err(TransportError::Closed(name.to_string()))
    }

    async fn publish(&self, topic: &str, _: Value) -> Result<(), TransportError> {
        Err(TransportError::Closed(topic.to_string()))
    }

    async fn call(&self, topic: &str, _: Value, _: Duration) -> Result<Value, TransportError> {
        Err(TransportError::Closed(topic.to_string()))
    }

    async fn open_queue(&self, name: &str) -> Result<Box<dyn QueueHandle>, TransportError> {
        Err(TransportError::Closed(name.to_string()))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_deploy_session_dispatches_task() {
    let (state, transport, env) = setup().await;
    let session = open_session(&state, &env).await;
    let tasks = state.config().tasks_topic.clone();
    transport.declare_queue(&tasks, QueueOptions::default()).await.unwrap();

    let deployment = deploy_session(&state, &session.id).await.unwrap();

    let stored = state.store().get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.state, SessionState::Deploying);
    let latest = state.store().latest_deployment(&env.id).await.unwrap().unwrap();
    assert_eq!(latest.id, deployment.id);
    assert!(!latest.is_finished());

    let mut queue = transport.open_queue(&tasks).await.unwrap();
    let delivery = queue.receive().await.unwrap().expect("task enqueued");
    let mut request: RpcRequest = serde_json::from_value(delivery.body.clone()).unwrap();
    assert_eq!(request.method, METHOD_HANDLE_TASK);
    let task = request.take_arg("task").unwrap();
    assert_eq!(task["id"], serde_json::json!(env.id));
    assert_eq!(task["deployment_id"], serde_json::json!(deployment.id));
    assert_eq!(task["model"], env.description);
}

#[tokio::test]
async fn test_second_deploying_session_conflicts() {
    let (state, transport, env) = setup().await;
    let first = open_session(&state, &env).await;
    let second = open_session(&state, &env).await;

    deploy_session(&state, &first.id).await.unwrap();
    let err = deploy_session(&state, &second.id).await.unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));

    // No second deployment and no second task
    let stored = state.store().get_session(&second.id).await.unwrap().unwrap();
    assert_eq!(stored.state, SessionState::Open);
    assert_eq!(transport.queue_depth(&state.config().tasks_topic), 1);
}

#[tokio::test]
async fn test_only_open_sessions_deploy() {
    let (state, _, env) = setup().await;
    let session = open_session(&state, &env).await;
    deploy_session(&state, &session.id).await.unwrap();

    let err = deploy_session(&state, &session.id).await.unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)));
}

#[tokio::test]
async fn test_unknown_session() {
    let (state, _, _) = setup().await;

    let err = deploy_session(&state, "nope").await.unwrap_err();
    assert_eq!(
        err,
        ControlError::NotFound {
            entity: "session",
            id: "nope".to_string()
        }
    );
}

#[tokio::test]
async fn test_failed_dispatch_reopens_session() {
    let store = Store::in_memory().await.unwrap();
    let state = AppState::new(Config::default(), store, Arc::new(UnreachableBroker));
    let env = Environment::new("web", None);
    state.store().create_environment(&env).await.unwrap();
    let session = open_session(&state, &env).await;

    let err = deploy_session(&state, &session.id).await.unwrap_err();
    assert!(matches!(err, ControlError::Transport(TransportError::Closed(_))));

    let stored = state.store().get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.state, SessionState::Open);
    assert!(state.store().latest_deployment(&env.id).await.unwrap().is_none());

    // A retry gets as far as dispatch again instead of failing validation
    let err = deploy_session(&state, &session.id).await.unwrap_err();
    assert!(matches!(err, ControlError::Transport(_)));
}
