//! Isolation boundary around plugin code.
//!
//! [`InProcessSandbox`] enforces the wall-clock limit, converts panics into
//! failures, honours force-cancellation and restricts egress to the declared
//! target through [`CheckContext`]. Process or container isolation plugs in
//! behind the same trait.

use super::check::{CheckContext, CheckError, CheckOutcome, LoadedPlugin};
use crate::models::{ExecutionError, ExecutionErrorKind};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Limits applied to one execution
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout: Duration,
    /// Fired on force-cancel; the execution is dropped at its next await point
    pub abort: CancellationToken,
}

impl SandboxLimits {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            abort: CancellationToken::new(),
        }
    }

    pub fn with_abort(timeout: Duration, abort: CancellationToken) -> Self {
        Self { timeout, abort }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        plugin: &LoadedPlugin,
        ctx: CheckContext,
        limits: &SandboxLimits,
    ) -> Result<CheckOutcome, ExecutionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessSandbox;

impl InProcessSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    async fn execute(
        &self,
        plugin: &LoadedPlugin,
        ctx: CheckContext,
        limits: &SandboxLimits,
    ) -> Result<CheckOutcome, ExecutionError> {
        let check = plugin.check.clone();
        let guarded = tokio::time::timeout(
            limits.timeout,
            AssertUnwindSafe(async move { check.run(&ctx).await }).catch_unwind(),
        );

        let outcome = tokio::select! {
            biased;
            _ = limits.abort.cancelled() => {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::Cancelled,
                    "execution aborted by force-cancel",
                ));
            }
            outcome = guarded => outcome,
        };

        match outcome {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(CheckError::EgressDenied { host, allowed }))) => Err(ExecutionError::new(
                ExecutionErrorKind::SandboxViolation,
                format!("egress to {host} denied; only {allowed} is reachable"),
            )),
            Ok(Ok(Err(CheckError::Failed(reason)))) => Err(ExecutionError::new(
                ExecutionErrorKind::PluginFailure,
                reason,
            )),
            Ok(Err(panic_error)) => {
                let panic_msg = if let Some(s) = panic_error.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_error.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                Err(ExecutionError::new(
                    ExecutionErrorKind::PluginFailure,
                    format!("plugin panicked: {panic_msg}"),
                ))
            }
            Err(_) => Err(ExecutionError::new(
                ExecutionErrorKind::Timeout,
                format!("timed out after {}ms", limits.timeout.as_millis()),
            )),
        }
    }
}
