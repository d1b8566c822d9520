//! Transport facade - typed access to the message bus
//!
//! Every component above the bus talks to it through [`Transport`]:
//!
//! - `publish` is fire-and-forget
//! - `call` sends a request and waits for the reply, bounded by a timeout
//! - `declare_queue` + `open_queue` give pull-based consumption with explicit ack
//!
//! Broker wire encoding lives behind the trait. [`InMemoryTransport`] is the
//! in-process broker used by the service binary and by tests.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

pub use memory::InMemoryTransport;

/// Result a remote handler sends back for a `call`
pub type ReplyResult = Result<Value, String>;

// ============================================================================
// Data Types
// ============================================================================

/// Queue declaration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Mirror the queue across broker nodes
    pub ha: bool,
    /// Undelivered messages older than this are discarded
    pub ttl: Option<Duration>,
}

/// A message pulled off a queue
#[derive(Debug)]
pub struct Delivery {
    /// Broker-assigned message id
    pub id: String,
    /// Delivery tag used to acknowledge this message
    pub tag: u64,
    pub body: Value,
    reply: Option<oneshot::Sender<ReplyResult>>,
}

impl Delivery {
    pub(crate) fn new(
        id: String,
        tag: u64,
        body: Value,
        reply: Option<oneshot::Sender<ReplyResult>>,
    ) -> Self {
        Self {
            id,
            tag,
            body,
            reply,
        }
    }

    /// Whether the sender is waiting for a reply
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Send the reply for a `call`. Returns false when nobody is waiting
    /// anymore (the caller timed out, or the message was a plain publish).
    pub fn reply(&mut self, result: ReplyResult) -> bool {
        match self.reply.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the transport
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("call to {topic} timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },

    #[error("no reply from {0}: request was dropped by the server")]
    NoReply(String),

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("queue closed: {0}")]
    Closed(String),

    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

// ============================================================================
// Facade Traits
// ============================================================================

#[async_trait]
pub trait Transport: Send + Sync {
    /// Create the queue if it does not exist. Re-declaring keeps existing messages.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Enqueue without waiting for any consumer.
    async fn publish(&self, topic: &str, body: Value) -> Result<(), TransportError>;

    /// Enqueue and wait for the consumer's reply.
    async fn call(&self, topic: &str, body: Value, timeout: Duration) -> Result<Value, TransportError>;

    /// Open a pull handle on a declared queue.
    async fn open_queue(&self, name: &str) -> Result<Box<dyn QueueHandle>, TransportError>;
}

#[async_trait]
pub trait QueueHandle: Send {
    /// Wait for the next message. `Ok(None)` means nothing arrived within the
    /// handle's poll window; callers simply pull again.
    async fn receive(&mut self) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledge a delivery. Unacknowledged deliveries go back on the
    /// queue when the handle is dropped.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    fn queue_name(&self) -> &str;
}
