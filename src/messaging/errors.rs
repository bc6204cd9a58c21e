//! # Message Bus Errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("queue {queue} does not exist")]
    QueueNotFound { queue: String },

    #[error("message {message_id} is not held in {queue}")]
    MessageNotFound { queue: String, message_id: u64 },

    /// Payload could not be encoded or decoded as a [`super::BusMessage`]
    #[error("cannot {direction} bus message: {reason}")]
    Codec {
        direction: &'static str,
        reason: String,
    },

    #[error("{operation} on {queue} failed: {reason}")]
    QueueOperation {
        queue: String,
        operation: String,
        reason: String,
    },

    /// The bus cannot be reached; callers may retry
    #[error("message bus unavailable: {reason}")]
    Unavailable { reason: String },
}

impl MessagingError {
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    pub fn message_not_found(queue: impl Into<String>, message_id: u64) -> Self {
        Self::MessageNotFound {
            queue: queue.into(),
            message_id,
        }
    }

    pub fn message_serialization(reason: impl Into<String>) -> Self {
        Self::Codec {
            direction: "encode",
            reason: reason.into(),
        }
    }

    pub fn message_deserialization(reason: impl Into<String>) -> Self {
        Self::Codec {
            direction: "decode",
            reason: reason.into(),
        }
    }

    pub fn queue_operation(
        queue: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue: queue.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}
