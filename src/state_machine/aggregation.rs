//! Task status as a function of its shards' statuses.

use super::{events::TaskEvent, states::ShardState, states::TaskState};
use crate::models::FailurePolicy;
use serde::{Deserialize, Serialize};

/// Shard counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCounts {
    pub total: usize,
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ShardCounts {
    pub fn from_states<I: IntoIterator<Item = ShardState>>(states: I) -> Self {
        let mut counts = Self::default();
        for state in states {
            counts.total += 1;
            match state {
                ShardState::Queued => counts.queued += 1,
                ShardState::Assigned => counts.assigned += 1,
                ShardState::Running => counts.running += 1,
                ShardState::Completed => counts.completed += 1,
                ShardState::Failed => counts.failed += 1,
                ShardState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Shards not yet in a terminal state
    pub fn unfinished(&self) -> usize {
        self.queued + self.assigned + self.running
    }

    pub fn in_flight(&self) -> usize {
        self.assigned + self.running
    }
}

/// Derive the event (if any) that brings the task in line with its shards.
///
/// `Paused` never results from aggregation. A failed shard fails the task at once
/// under `FailFast`, and only after every other shard finished under `BestEffort`.
pub fn aggregate_task_event(
    current: TaskState,
    counts: &ShardCounts,
    failure_policy: FailurePolicy,
) -> Option<TaskEvent> {
    if current.is_terminal() || counts.total == 0 {
        return None;
    }

    if counts.completed == counts.total {
        return Some(TaskEvent::Complete);
    }

    if counts.failed > 0 {
        let escalate = match failure_policy {
            FailurePolicy::FailFast => true,
            FailurePolicy::BestEffort => counts.unfinished() == 0,
        };
        if escalate {
            return Some(TaskEvent::Fail(format!(
                "{} of {} shards failed ({} completed)",
                counts.failed, counts.total, counts.completed
            )));
        }
    }

    if current == TaskState::Dispatching && (counts.in_flight() > 0 || counts.completed > 0) {
        return Some(TaskEvent::Start);
    }

    None
}
