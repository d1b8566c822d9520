//! RPC client facade
//!
//! Two narrow clients over the transport:
//!
//! - [`TaskClient`] hands deployment tasks to the executor and returns as
//!   soon as the message is enqueued.
//! - [`ResultsClient`] delivers a final result to ingestion and blocks until
//!   the remote handler replies or the timeout elapses. On timeout nothing is
//!   known about how far ingestion got.
//!
//! Neither client retries; that is the caller's call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::transport::{Transport, TransportError};

pub const METHOD_HANDLE_TASK: &str = "handle_task";
pub const METHOD_PROCESS_RESULT: &str = "process_result";

pub const DEFAULT_RESULTS_TIMEOUT: Duration = Duration::from_secs(15);

/// Request envelope carried on the tasks and results topics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Take a named argument out of `args`
    pub fn take_arg(&mut self, name: &str) -> Option<Value> {
        self.args.as_object_mut().and_then(|args| args.remove(name))
    }

    fn into_value(self) -> Value {
        json!({ "method": self.method, "args": self.args })
    }
}

/// Executor dispatch, fire-and-forget
#[derive(Clone)]
pub struct TaskClient {
    transport: Arc<dyn Transport>,
    topic: String,
}

impl TaskClient {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }

    pub async fn dispatch_task(&self, task: Value) -> Result<(), TransportError> {
        let request = RpcRequest::new(METHOD_HANDLE_TASK, json!({ "task": task }));
        self.transport.publish(&self.topic, request.into_value()).await?;
        tracing::debug!(topic = %self.topic, "Dispatched task to executor");
        Ok(())
    }
}

/// Synchronous result delivery to ingestion
#[derive(Clone)]
pub struct ResultsClient {
    transport: Arc<dyn Transport>,
    topic: String,
    timeout: Duration,
}

impl ResultsClient {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
            timeout: DEFAULT_RESULTS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn deliver_result(&self, result: Value) -> Result<Value, TransportError> {
        let request = RpcRequest::new(METHOD_PROCESS_RESULT, json!({ "result": result }));
        let reply = self
            .transport
            .call(&self.topic, request.into_value(), self.timeout)
            .await;

        if let Err(ref e) = reply {
            tracing::warn!(topic = %self.topic, error = %e, "Result delivery failed");
        }
        reply
    }
}
