use super::{
    errors::{StateMachineError, StateMachineResult},
    events::ShardEvent,
    states::ShardState,
};

/// Outcome of a shard transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardTransition {
    pub state: ShardState,
    pub retry_count: u32,
}

/// Shard lifecycle transitions with a retry budget
#[derive(Debug, Clone, Copy)]
pub struct ShardStateMachine {
    max_retries: u32,
}

impl ShardStateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Determine the next state and retry count for an event
    pub fn transition(
        &self,
        current: ShardState,
        retry_count: u32,
        event: &ShardEvent,
    ) -> StateMachineResult<ShardTransition> {
        let unchanged = |state| ShardTransition { state, retry_count };

        let next = match (current, event) {
            (ShardState::Queued, ShardEvent::Assign) => unchanged(ShardState::Assigned),
            (ShardState::Assigned, ShardEvent::Start) => unchanged(ShardState::Running),

            // Results can overtake the ack on an at-least-once bus
            (ShardState::Assigned | ShardState::Running, ShardEvent::Complete) => {
                unchanged(ShardState::Completed)
            }

            (
                ShardState::Assigned | ShardState::Running,
                ShardEvent::Fail {
                    retryable: true, ..
                }
                | ShardEvent::Requeue { .. },
            ) => self.consume_retry(retry_count),

            (
                ShardState::Queued | ShardState::Assigned | ShardState::Running,
                ShardEvent::Fail {
                    retryable: false, ..
                },
            ) => unchanged(ShardState::Failed),

            (ShardState::Assigned | ShardState::Running, ShardEvent::Release) => {
                unchanged(ShardState::Queued)
            }

            (from, ShardEvent::Cancel) if !from.is_terminal() => unchanged(ShardState::Cancelled),

            (from_state, _) => {
                return Err(StateMachineError::invalid_transition(
                    "shard",
                    from_state,
                    event.event_type(),
                ))
            }
        };

        Ok(next)
    }

    fn consume_retry(&self, retry_count: u32) -> ShardTransition {
        let retry_count = retry_count.saturating_add(1);
        let state = if retry_count > self.max_retries {
            ShardState::Failed
        } else {
            ShardState::Queued
        };
        ShardTransition { state, retry_count }
    }
}
