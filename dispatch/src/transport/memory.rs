//! In-process broker
//!
//! Queues live in a shared map guarded by a mutex. Each queue keeps a
//! `Notify` so a pulling handle parks until a publish wakes it or its poll
//! window runs out. Messages older than the queue TTL are discarded when a
//! consumer reaches them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use super::{Delivery, QueueHandle, QueueOptions, ReplyResult, Transport, TransportError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Envelope {
    id: String,
    body: Value,
    enqueued_at: Instant,
    reply: Option<oneshot::Sender<ReplyResult>>,
}

struct QueueState {
    options: QueueOptions,
    messages: VecDeque<Envelope>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            messages: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_expired(&self, enqueued_at: Instant, now: Instant) -> bool {
        self.options
            .ttl
            .is_some_and(|ttl| now.saturating_duration_since(enqueued_at) > ttl)
    }

    /// Next message still within its TTL
    fn pop_live(&mut self, queue: &str) -> Option<Envelope> {
        let now = Instant::now();
        while let Some(envelope) = self.messages.pop_front() {
            if self.is_expired(envelope.enqueued_at, now) {
                tracing::debug!(queue = %queue, message_id = %envelope.id, "Discarding expired message");
                continue;
            }
            return Some(envelope);
        }
        None
    }
}

#[derive(Default)]
struct Broker {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

/// Process-local message bus
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: Arc<Mutex<Broker>>,
    poll_interval: Duration,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl InMemoryTransport {
    /// `poll_interval` bounds how long a single `receive` parks before
    /// returning `Ok(None)`.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            broker: Arc::new(Mutex::new(Broker::default())),
            poll_interval,
        }
    }

    /// Messages currently waiting on a queue (expired ones included)
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|queue| queue.messages.len())
            .unwrap_or(0)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.lock().queues.get(name).map(|queue| queue.options)
    }

    fn lock(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, topic: &str, body: Value, reply: Option<oneshot::Sender<ReplyResult>>) {
        let envelope = Envelope {
            id: ulid::Ulid::new().to_string(),
            body,
            enqueued_at: Instant::now(),
            reply,
        };

        let mut broker = self.lock();
        let queue = broker
            .queues
            .entry(topic.to_string())
            .or_insert_with(|| QueueState::new(QueueOptions::default()));

        tracing::trace!(queue = %topic, message_id = %envelope.id, "Enqueued message");
        queue.messages.push_back(envelope);
        queue.notify.notify_one();
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError> {
        let mut broker = self.lock();
        let queue = broker
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState::new(options));
        queue.options = options;

        tracing::debug!(queue = %name, ha = options.ha, ttl = ?options.ttl, "Declared queue");
        Ok(())
    }

    async fn publish(&self, topic: &str, body: Value) -> Result<(), TransportError> {
        self.enqueue(topic, body, None);
        Ok(())
    }

    async fn call(&self, topic: &str, body: Value, timeout: Duration) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(topic, body, Some(tx));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(remote))) => Err(TransportError::Remote(remote)),
            Ok(Err(_)) => Err(TransportError::NoReply(topic.to_string())),
            Err(_) => Err(TransportError::Timeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }

    async fn open_queue(&self, name: &str) -> Result<Box<dyn QueueHandle>, TransportError> {
        let notify = self
            .lock()
            .queues
            .get(name)
            .map(|queue| queue.notify.clone())
            .ok_or_else(|| TransportError::Closed(name.to_string()))?;

        Ok(Box::new(MemoryQueueHandle {
            name: name.to_string(),
            broker: self.broker.clone(),
            notify,
            poll_interval: self.poll_interval,
            unacked: HashMap::new(),
        }))
    }
}

// ============================================================================
// Queue Handle
// ============================================================================

struct Unacked {
    id: String,
    body: Value,
    enqueued_at: Instant,
}

struct MemoryQueueHandle {
    name: String,
    broker: Arc<Mutex<Broker>>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    unacked: HashMap<u64, Unacked>,
}

impl MemoryQueueHandle {
    fn try_take(&mut self) -> Result<Option<Delivery>, TransportError> {
        let mut guard = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        let broker = &mut *guard;
        let queue = broker
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| TransportError::Closed(self.name.clone()))?;

        let Some(envelope) = queue.pop_live(&self.name) else {
            return Ok(None);
        };

        broker.next_tag += 1;
        let tag = broker.next_tag;
        self.unacked.insert(
            tag,
            Unacked {
                id: envelope.id.clone(),
                body: envelope.body.clone(),
                enqueued_at: envelope.enqueued_at,
            },
        );

        Ok(Some(Delivery::new(envelope.id, tag, envelope.body, envelope.reply)))
    }
}

#[async_trait]
impl QueueHandle for MemoryQueueHandle {
    async fn receive(&mut self) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            let notify = self.notify.clone();
            if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: self.name.clone(),
                tag: delivery.tag,
            })
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemoryQueueHandle {
    fn drop(&mut self) {
        if self.unacked.is_empty() {
            return;
        }

        let mut pending: Vec<(u64, Unacked)> = self.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);

        let mut broker = self.broker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = broker.queues.get_mut(&self.name) {
            tracing::debug!(queue = %self.name, count = pending.len(), "Requeueing unacknowledged messages");
            // Replies are not redelivered; a waiting caller sees its own timeout.
            for (_, message) in pending.into_iter().rev() {
                queue.messages.push_front(Envelope {
                    id: message.id,
                    body: message.body,
                    enqueued_at: message.enqueued_at,
                    reply: None,
                });
            }
            queue.notify.notify_one();
        }
    }
}
