//! # Messaging Module
//!
//! Queue-based transport between the scheduling center and the scanning nodes:
//! shard assignments and control signals flow out, acks, results, shard reports
//! and heartbeats flow back. Delivery is at-least-once; consumers de-duplicate.

pub mod bus;
pub mod dedup;
pub mod errors;
pub mod in_memory;
pub mod message;

pub use bus::MessageBus;
pub use dedup::ResultDeduplicator;
pub use errors::MessagingError;
pub use in_memory::{BusStats, InMemoryMessageBus};
pub use message::{
    AssignmentAck, BusMessage, ControlAction, ControlMessage, ReceivedMessage, ShardAssignment,
    SignalledShard,
};
