//! # Error Types
//!
//! Crate-wide error taxonomy. Per-target and per-plugin failures are recorded as
//! execution results and never surface here; these errors are what operations
//! return to their callers.

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::persistence::PersistenceError;
use crate::registry::RegistryError;
use crate::state_machine::StateMachineError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Malformed task request; rejected before anything is persisted
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Cannot {operation} {entity} {id} in state {current}")]
    InvalidState {
        entity: &'static str,
        id: String,
        current: String,
        operation: &'static str,
    },

    /// Dispatch queue is above its watermark; callers should back off
    #[error("Scheduler overloaded: queue depth {depth} exceeds watermark {watermark}")]
    Overloaded { depth: usize, watermark: usize },

    #[error("Node {node_id} did not acknowledge shard {shard_id}")]
    AssignmentTimeout { shard_id: String, node_id: String },

    #[error("Plugin {plugin_id} timed out after {timeout:?} on {target}")]
    ExecutionTimeout {
        plugin_id: String,
        target: String,
        timeout: Duration,
    },

    #[error("Plugin {plugin_id} failed on {target}: {reason}")]
    PluginExecution {
        plugin_id: String,
        target: String,
        reason: String,
    },

    #[error("Node {node_id} lost: no heartbeat within {silence:?}")]
    NodeLost { node_id: String, silence: Duration },

    /// A report carried an assignment token that is no longer current
    #[error("Stale assignment for shard {shard_id}")]
    StaleAssignment { shard_id: String },

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScanError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        entity: &'static str,
        id: impl ToString,
        current: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.to_string(),
            current: current.to_string(),
            operation,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Overloaded { .. }
                | Self::AssignmentTimeout { .. }
                | Self::NodeLost { .. }
                | Self::Messaging(_)
                | Self::Persistence(_)
        )
    }

    /// Stable code for API surfaces
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Overloaded { .. } => "overloaded",
            Self::AssignmentTimeout { .. } => "assignment_timeout",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::PluginExecution { .. } => "plugin_execution_error",
            Self::NodeLost { .. } => "node_lost",
            Self::StaleAssignment { .. } => "stale_assignment",
            Self::Messaging(_) => "messaging_error",
            Self::Persistence(_) => "persistence_error",
            Self::StateMachine(_) => "state_machine_error",
            Self::Configuration(_) => "configuration_error",
            Self::Registry(_) => "registry_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
