use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskState,
};

/// Task lifecycle transitions.
///
/// `Pending` and `Sharding` are entered and left inside task creation. Terminal
/// states accept no events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskStateMachine {
    state: TaskState,
}

impl TaskStateMachine {
    pub fn new(state: TaskState) -> Self {
        Self { state }
    }

    pub fn current_state(&self) -> TaskState {
        self.state
    }

    /// Apply an event, returning the new state
    pub fn transition(&mut self, event: &TaskEvent) -> StateMachineResult<TaskState> {
        let target = Self::determine_target_state(self.state, event)?;
        self.state = target;
        Ok(target)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: TaskState,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskState> {
        let target = match (current_state, event) {
            (TaskState::Pending, TaskEvent::BeginSharding) => TaskState::Sharding,
            (TaskState::Sharding, TaskEvent::ShardsQueued) => TaskState::Dispatching,
            (TaskState::Dispatching, TaskEvent::Start) => TaskState::Running,

            // Pause halts dispatch; resume puts the task back to work
            (TaskState::Dispatching | TaskState::Running, TaskEvent::Pause) => TaskState::Paused,
            (TaskState::Paused, TaskEvent::Resume) => TaskState::Running,

            // In-flight shards may finish the task while it is paused
            (
                TaskState::Dispatching | TaskState::Running | TaskState::Paused,
                TaskEvent::Complete,
            ) => TaskState::Completed,

            (from, TaskEvent::Fail(_)) if !from.is_terminal() => TaskState::Failed,
            (from, TaskEvent::Cancel) if !from.is_terminal() => TaskState::Cancelled,

            (from_state, _) => {
                return Err(StateMachineError::invalid_transition(
                    "task",
                    from_state,
                    event.event_type(),
                ))
            }
        };

        Ok(target)
    }
}
