//! AgentListenerActor - correlates agent execution results with waiting callers
//!
//! One listener per agent/environment. Each listener owns a durable result
//! queue and a single background receive task:
//!
//! - The receive task declares the queue (HA, 24h TTL), pulls, acks every
//!   message straight away and forwards it to the actor.
//! - The actor owns the subscription registry, so `Subscribe` and the
//!   match-and-remove of an arriving result are serialized by its mailbox.
//!
//! A result only reaches a waiter that subscribed before it arrived. Results
//! with no pending subscription are dropped, and so is a second result with an
//! already consumed id. Stopping the listener leaves pending waiters
//! unresolved; callers bound their own wait. A waiter dropped by its caller
//! is pruned on the next subscribe or status query.
//!
//! # Example
//!
//! ```rust,ignore
//! let listener = state.spawn_agent_listener("Env-1").await?;
//! agent_listener::start(&listener).await?;
//! let waiter = agent_listener::subscribe(&listener, "msg-42").await?;
//! let body = tokio::time::timeout(Duration::from_secs(600), waiter).await??;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{cast, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use shared_types::SOURCE_ID_FIELD;

use crate::transport::{Delivery, QueueOptions, Transport};

/// Resolves with the result body once a matching message arrives
pub type ResultWaiter = oneshot::Receiver<Value>;

/// Queue an agent posts its execution results to
pub fn results_queue_name(name: &str) -> String {
    format!("-execution-results-{}", name.to_lowercase())
}

/// Correlation id of a result: the body's `SourceID`, else the broker message id
pub fn correlation_id(delivery: &Delivery) -> String {
    match delivery.body.get(SOURCE_ID_FIELD) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => delivery.id.clone(),
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum AgentListenerMsg {
    /// Spawn the receive task unless it is already running
    Start { reply: RpcReplyPort<bool> },

    /// Terminate the receive task; pending subscriptions stay unresolved
    Stop { reply: RpcReplyPort<bool> },

    /// Register a one-shot waiter for a correlation id
    Subscribe {
        correlation_id: String,
        reply: RpcReplyPort<Result<ResultWaiter, AgentListenerError>>,
    },

    /// A result pulled off the queue by the receive task
    Delivered { correlation_id: String, body: Value },

    GetStatus { reply: RpcReplyPort<ListenerStatus> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub queue_name: String,
    pub running: bool,
    pub pending: usize,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AgentListenerError {
    #[error("correlation id already used: {0}")]
    DuplicateSubscription(String),

    #[error("agent listener unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Actor
// ============================================================================

pub struct AgentListenerArguments {
    /// Listener identity; the queue name derives from it
    pub name: String,
    pub transport: Arc<dyn Transport>,
    pub ttl: Duration,
}

pub struct AgentListenerState {
    queue_name: String,
    transport: Arc<dyn Transport>,
    ttl: Duration,
    subscriptions: HashMap<String, oneshot::Sender<Value>>,
    /// Ids that were fulfilled; never handed out again
    retired: HashSet<String>,
    receive_task: Option<JoinHandle<()>>,
}

impl AgentListenerState {
    fn is_running(&self) -> bool {
        self.receive_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Drop subscriptions whose caller stopped waiting. Their ids stay retired.
    fn prune_abandoned(&mut self) -> usize {
        let abandoned: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, waiter)| waiter.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for id in &abandoned {
            self.subscriptions.remove(id);
        }
        let count = abandoned.len();
        self.retired.extend(abandoned);
        if count > 0 {
            tracing::debug!(queue = %self.queue_name, count, "Pruned abandoned subscriptions");
        }
        count
    }
}

#[derive(Debug, Default)]
pub struct AgentListenerActor;

#[async_trait]
impl Actor for AgentListenerActor {
    type Msg = AgentListenerMsg;
    type State = AgentListenerState;
    type Arguments = AgentListenerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let queue_name = results_queue_name(&args.name);
        tracing::info!(
            actor_id = %myself.get_id(),
            queue = %queue_name,
            "AgentListenerActor starting"
        );

        Ok(AgentListenerState {
            queue_name,
            transport: args.transport,
            ttl: args.ttl,
            subscriptions: HashMap::new(),
            retired: HashSet::new(),
            receive_task: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AgentListenerMsg::Start { reply } => {
                let started = self.handle_start(myself, state);
                let _ = reply.send(started);
            }
            AgentListenerMsg::Stop { reply } => {
                let stopped = self.handle_stop(state);
                let _ = reply.send(stopped);
            }
            AgentListenerMsg::Subscribe {
                correlation_id,
                reply,
            } => {
                let result = self.handle_subscribe(correlation_id, state);
                let _ = reply.send(result);
            }
            AgentListenerMsg::Delivered {
                correlation_id,
                body,
            } => self.handle_delivered(correlation_id, body, state),
            AgentListenerMsg::GetStatus { reply } => {
                state.prune_abandoned();
                let _ = reply.send(ListenerStatus {
                    queue_name: state.queue_name.clone(),
                    running: state.is_running(),
                    pending: state.subscriptions.len(),
                });
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(task) = state.receive_task.take() {
            task.abort();
        }
        tracing::info!(
            actor_id = %myself.get_id(),
            queue = %state.queue_name,
            abandoned = state.subscriptions.len(),
            "AgentListenerActor stopped"
        );
        Ok(())
    }
}

impl AgentListenerActor {
    fn handle_start(&self, myself: ActorRef<AgentListenerMsg>, state: &mut AgentListenerState) -> bool {
        if state.is_running() {
            return false;
        }

        let task = tokio::spawn(receive_loop(
            myself,
            state.transport.clone(),
            state.queue_name.clone(),
            state.ttl,
        ));
        state.receive_task = Some(task);

        tracing::info!(queue = %state.queue_name, "Agent result receive loop started");
        true
    }

    fn handle_stop(&self, state: &mut AgentListenerState) -> bool {
        let Some(task) = state.receive_task.take() else {
            return false;
        };
        let was_running = !task.is_finished();
        task.abort();

        tracing::info!(
            queue = %state.queue_name,
            pending = state.subscriptions.len(),
            "Agent result receive loop stopped"
        );
        was_running
    }

    fn handle_subscribe(
        &self,
        correlation_id: String,
        state: &mut AgentListenerState,
    ) -> Result<ResultWaiter, AgentListenerError> {
        state.prune_abandoned();
        if state.subscriptions.contains_key(&correlation_id) || state.retired.contains(&correlation_id) {
            return Err(AgentListenerError::DuplicateSubscription(correlation_id));
        }

        let (tx, rx) = oneshot::channel();
        tracing::debug!(queue = %state.queue_name, correlation_id = %correlation_id, "Subscribed");
        state.subscriptions.insert(correlation_id, tx);
        Ok(rx)
    }

    fn handle_delivered(&self, correlation_id: String, body: Value, state: &mut AgentListenerState) {
        match state.subscriptions.remove(&correlation_id) {
            Some(waiter) => {
                if waiter.send(body).is_err() {
                    tracing::debug!(correlation_id = %correlation_id, "Waiter went away before its result arrived");
                }
                state.retired.insert(correlation_id);
            }
            None => {
                tracing::debug!(
                    queue = %state.queue_name,
                    correlation_id = %correlation_id,
                    "No subscription for result, dropping"
                );
            }
        }
    }
}

/// Pull loop: declare, open, then receive -> ack -> forward until aborted.
async fn receive_loop(
    listener: ActorRef<AgentListenerMsg>,
    transport: Arc<dyn Transport>,
    queue_name: String,
    ttl: Duration,
) {
    let options = QueueOptions {
        ha: true,
        ttl: Some(ttl),
    };
    if let Err(e) = transport.declare_queue(&queue_name, options).await {
        tracing::error!(queue = %queue_name, error = %e, "Failed to declare results queue");
        return;
    }

    let mut queue = match transport.open_queue(&queue_name).await {
        Ok(queue) => queue,
        Err(e) => {
            tracing::error!(queue = %queue_name, error = %e, "Failed to open results queue");
            return;
        }
    };

    loop {
        let delivery = match queue.receive().await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(queue = %queue_name, error = %e, "Results queue receive failed");
                return;
            }
        };

        if let Err(e) = queue.ack(&delivery).await {
            tracing::warn!(queue = %queue_name, error = %e, "Failed to ack result");
        }

        let correlation_id = correlation_id(&delivery);
        let message = AgentListenerMsg::Delivered {
            correlation_id,
            body: delivery.body,
        };
        if cast!(listener, message).is_err() {
            tracing::debug!(queue = %queue_name, "Listener actor gone, ending receive loop");
            return;
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub async fn spawn_agent_listener(
    name: &str,
    transport: Arc<dyn Transport>,
    ttl: Duration,
) -> Result<ActorRef<AgentListenerMsg>, AgentListenerError> {
    let (listener, _handle) = Actor::spawn(
        Some(format!("agent_listener:{}:{}", name.to_lowercase(), ulid::Ulid::new())),
        AgentListenerActor,
        AgentListenerArguments {
            name: name.to_string(),
            transport,
            ttl,
        },
    )
    .await
    .map_err(|e| AgentListenerError::Unavailable(e.to_string()))?;
    Ok(listener)
}

/// Start the receive loop. Returns false if it was already running.
pub async fn start(listener: &ActorRef<AgentListenerMsg>) -> Result<bool, AgentListenerError> {
    ractor::call!(listener, |reply| AgentListenerMsg::Start { reply })
        .map_err(|e| AgentListenerError::Unavailable(e.to_string()))
}

/// Stop the receive loop. Returns false if it was not running.
pub async fn stop(listener: &ActorRef<AgentListenerMsg>) -> Result<bool, AgentListenerError> {
    ractor::call!(listener, |reply| AgentListenerMsg::Stop { reply })
        .map_err(|e| AgentListenerError::Unavailable(e.to_string()))
}

/// Register interest in a correlation id. The registration is in place when
/// this returns; await the waiter (with a timeout) for the result body.
pub async fn subscribe(
    listener: &ActorRef<AgentListenerMsg>,
    correlation_id: impl Into<String>,
) -> Result<ResultWaiter, AgentListenerError> {
    let correlation_id = correlation_id.into();
    ractor::call!(listener, |reply| AgentListenerMsg::Subscribe {
        correlation_id,
        reply,
    })
    .map_err(|e| AgentListenerError::Unavailable(e.to_string()))?
}

pub async fn status(listener: &ActorRef<AgentListenerMsg>) -> Result<ListenerStatus, AgentListenerError> {
    ractor::call!(listener, |reply| AgentListenerMsg::GetStatus { reply })
        .map_err(|e| AgentListenerError::Unavailable(e.to_string()))
}
