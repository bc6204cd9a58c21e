//! # In-Memory Message Bus
//!
//! Thread-safe in-memory queue implementation for tests and single-process
//! deployments.
//!
//! - **Visibility Timeout**: received messages are hidden until acked, nacked or timed out
//! - **Serialized Payloads**: messages are stored as JSON bytes, like a real broker
//! - **Thread-Safe**: a `tokio::sync::RwLock` guards the queue map
//!
//! ```rust
//! use vulnscan_core::constants::queues;
//! use vulnscan_core::messaging::{InMemoryMessageBus, MessageBus};
//!
//! # tokio_test::block_on(async {
//! let bus = InMemoryMessageBus::new();
//! bus.ensure_queue(queues::RESULTS).await.unwrap();
//! assert!(bus.peek_all(queues::RESULTS).await.is_empty());
//! # });
//! ```

use super::bus::MessageBus;
use super::errors::MessagingError;
use super::message::{BusMessage, ReceivedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    /// When the message becomes visible again (None = visible now)
    visible_at: Option<DateTime<Utc>>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<StoredMessage>,
    total_sent: u64,
    total_acked: u64,
}

/// Per-bus delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
}

#[derive(Debug)]
pub struct InMemoryMessageBus {
    queues: RwLock<HashMap<String, Queue>>,
    next_id: AtomicU64,
    published: AtomicU64,
    received: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            received: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
        }
    }

    /// Decode every stored message of a queue without changing visibility (for tests)
    pub async fn peek_all(&self, queue: &str) -> Vec<BusMessage> {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .map(|q| {
                q.messages
                    .iter()
                    .filter_map(|m| BusMessage::from_bytes(&m.payload).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total messages ever published to a queue (for tests)
    pub async fn total_sent(&self, queue: &str) -> u64 {
        let queues = self.queues.read().await;
        queues.get(queue).map(|q| q.total_sent).unwrap_or(0)
    }

    /// Drop every message of a queue (for tests)
    pub async fn clear_queue(&self, queue: &str) {
        let mut queues = self.queues.write().await;
        if let Some(q) = queues.get_mut(queue) {
            q.messages.clear();
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn ensure_queue(&self, queue: &str) -> Result<(), MessagingError> {
        let mut queues = self.queues.write().await;
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &BusMessage) -> Result<u64, MessagingError> {
        let payload = message.to_bytes()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut queues = self.queues.write().await;
        let q = queues.entry(queue.to_string()).or_default();
        q.messages.push_back(StoredMessage {
            id,
            payload,
            enqueued_at: Utc::now(),
            visible_at: None,
            receive_count: 0,
        });
        q.total_sent += 1;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, MessagingError> {
        let mut queues = self.queues.write().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;

        let now = Utc::now();
        let hidden_for = chrono::Duration::from_std(visibility_timeout)
            .map_err(|e| MessagingError::queue_operation(queue, "receive", e.to_string()))?;
        let mut received = Vec::new();

        for stored in q.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            let visible = stored.visible_at.map(|at| at <= now).unwrap_or(true);
            if !visible {
                continue;
            }

            let message = BusMessage::from_bytes(&stored.payload)?;
            stored.visible_at = Some(now + hidden_for);
            stored.receive_count += 1;
            self.received.fetch_add(1, Ordering::Relaxed);

            received.push(ReceivedMessage {
                id: stored.id,
                queue: queue.to_string(),
                receive_count: stored.receive_count,
                enqueued_at: stored.enqueued_at,
                message,
            });
        }

        Ok(received)
    }

    async fn ack(&self, queue: &str, message_id: u64) -> Result<(), MessagingError> {
        let mut queues = self.queues.write().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;

        let pos = q
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| MessagingError::message_not_found(queue, message_id))?;
        q.messages.remove(pos);
        q.total_acked += 1;
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        message_id: u64,
        requeue: bool,
    ) -> Result<(), MessagingError> {
        let mut queues = self.queues.write().await;
        let q = queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;

        let pos = q
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| MessagingError::message_not_found(queue, message_id))?;
        if requeue {
            if let Some(stored) = q.messages.get_mut(pos) {
                stored.visible_at = None;
            }
        } else {
            q.messages.remove(pos);
        }
        self.nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, MessagingError> {
        let queues = self.queues.read().await;
        Ok(queues.get(queue).map(|q| q.messages.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::AssignmentAck;
    use crate::models::{AssignmentToken, ShardId};

    fn ack_message() -> BusMessage {
        BusMessage::Ack(AssignmentAck {
            shard_id: ShardId::new(),
            node_id: "node-a".into(),
            token: AssignmentToken::new(),
        })
    }

    #[tokio::test]
    async fn test_received_message_is_invisible_until_timeout() {
        let bus = InMemoryMessageBus::new();
        bus.publish("q", &ack_message()).await.unwrap();

        let first = bus.receive("q", 10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(bus.receive("q", 10, Duration::from_millis(50)).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = bus.receive("q", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert!(again[0].is_redelivery());
        assert_eq!(again[0].message, first[0].message);
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let bus = InMemoryMessageBus::new();
        bus.publish("q", &ack_message()).await.unwrap();
        let received = bus.receive("q", 1, Duration::from_secs(30)).await.unwrap();
        bus.ack("q", received[0].id).await.unwrap();
        assert_eq!(bus.queue_depth("q").await.unwrap(), 0);
        assert!(matches!(
            bus.ack("q", received[0].id).await,
            Err(MessagingError::MessageNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_nack_requeue_makes_message_visible() {
        let bus = InMemoryMessageBus::new();
        bus.publish("q", &ack_message()).await.unwrap();
        let received = bus.receive("q", 1, Duration::from_secs(30)).await.unwrap();
        bus.nack("q", received[0].id, true).await.unwrap();
        assert_eq!(bus.receive("q", 1, Duration::from_secs(30)).await.unwrap().len(), 1);
        assert_eq!(bus.stats().nacked, 1);
    }

    #[tokio::test]
    async fn test_receive_from_unknown_queue_fails() {
        let bus = InMemoryMessageBus::new();
        let result = bus.receive("missing", 1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MessagingError::QueueNotFound { .. })));
    }
}
