// State machines for scan tasks and their shards.
//
// Transitions are pure functions of (state, event); owners persist the result.

pub mod aggregation;
pub mod errors;
pub mod events;
pub mod shard_state_machine;
pub mod states;
pub mod task_state_machine;

// Re-export main types for convenient access
pub use aggregation::{aggregate_task_event, ShardCounts};
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{ShardEvent, TaskEvent};
pub use shard_state_machine::{ShardStateMachine, ShardTransition};
pub use states::{ShardState, TaskState};
pub use task_state_machine::TaskStateMachine;
