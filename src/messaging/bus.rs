//! Message bus abstraction with at-least-once delivery.

use super::errors::MessagingError;
use super::message::{BusMessage, ReceivedMessage};
use async_trait::async_trait;
use std::time::Duration;

/// Durable, at-least-once queue transport.
///
/// Received messages stay on the queue until acknowledged; an unacknowledged
/// message becomes visible again after its visibility timeout, so consumers must
/// tolerate redelivery.
#[async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug {
    /// Create the queue if it does not exist
    async fn ensure_queue(&self, queue: &str) -> Result<(), MessagingError>;

    /// Append a message; queues are created on first publish
    async fn publish(&self, queue: &str, message: &BusMessage) -> Result<u64, MessagingError>;

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, MessagingError>;

    async fn ack(&self, queue: &str, message_id: u64) -> Result<(), MessagingError>;

    /// Return a message to the queue (`requeue`) or drop it
    async fn nack(&self, queue: &str, message_id: u64, requeue: bool)
        -> Result<(), MessagingError>;

    /// Messages currently stored, visible or not
    async fn queue_depth(&self, queue: &str) -> Result<usize, MessagingError>;
}
