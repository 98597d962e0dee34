//! Operation polling
//!
//! Waits for an initiated operation to leave the running states. The wait is
//! bounded locally; running out of time yields [`TerminalStatus::TimedOut`],
//! which says nothing about the server-side outcome.

use crate::clock::Clock;
use crate::error::{ErrorClass, ServiceError};
use crate::serializer::OperationHandle;
use crate::service::{DeploymentService, OperationStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default interval between status queries
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 20;

/// Default local wait budget per operation (20 minutes)
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 1200;

/// How waiting on an operation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TerminalStatus {
    /// Operation succeeded
    Succeeded,
    /// Operation failed
    Failed {
        /// Service-reported reason
        reason: Option<String>,
    },
    /// Operation was stopped
    Stopped {
        /// Service-reported reason
        reason: Option<String>,
    },
    /// Local wait budget ran out while the operation was still running
    TimedOut,
}

impl TerminalStatus {
    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Polls operation status until it is terminal
pub struct OperationPoller {
    service: Arc<dyn DeploymentService>,
    clock: Arc<dyn Clock>,
    stack_set_name: String,
    interval: Duration,
}

impl OperationPoller {
    /// Create a poller with the default interval
    pub fn new(
        service: Arc<dyn DeploymentService>,
        clock: Arc<dyn Clock>,
        stack_set_name: impl Into<String>,
    ) -> Self {
        Self {
            service,
            clock,
            stack_set_name: stack_set_name.into(),
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }

    /// Set the polling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Polling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the operation is terminal or `timeout` elapses
    ///
    /// Transient query errors are retried on the next tick. Any other query
    /// error ends the wait.
    pub async fn await_terminal(
        &self,
        handle: &OperationHandle,
        timeout: Duration,
    ) -> std::result::Result<TerminalStatus, ServiceError> {
        let start = self.clock.now();

        info!(
            operation_id = %handle.operation_id,
            timeout_secs = timeout.as_secs(),
            "Waiting for operation to complete"
        );

        loop {
            match self
                .service
                .describe_stack_set_operation(&self.stack_set_name, &handle.operation_id)
                .await
            {
                Ok(operation) => match operation.status {
                    OperationStatus::Succeeded => {
                        info!(
                            operation_id = %handle.operation_id,
                            elapsed_secs = self.clock.elapsed_since(start).as_secs_f64(),
                            "Operation succeeded"
                        );
                        return Ok(TerminalStatus::Succeeded);
                    }
                    OperationStatus::Failed => {
                        warn!(
                            operation_id = %handle.operation_id,
                            reason = ?operation.status_reason,
                            "Operation failed"
                        );
                        return Ok(TerminalStatus::Failed {
                            reason: operation.status_reason,
                        });
                    }
                    OperationStatus::Stopped => {
                        warn!(operation_id = %handle.operation_id, "Operation stopped");
                        return Ok(TerminalStatus::Stopped {
                            reason: operation.status_reason,
                        });
                    }
                    OperationStatus::Queued
                    | OperationStatus::Running
                    | OperationStatus::Stopping => {
                        debug!(
                            operation_id = %handle.operation_id,
                            status = %operation.status,
                            "Operation still running"
                        );
                    }
                },
                Err(e) if e.class() == ErrorClass::Transient => {
                    debug!(
                        operation_id = %handle.operation_id,
                        error = %e,
                        "Status query failed, will retry"
                    );
                }
                Err(e) => {
                    warn!(
                        operation_id = %handle.operation_id,
                        error = %e,
                        "Status query failed"
                    );
                    return Err(e);
                }
            }

            let elapsed = self.clock.elapsed_since(start);
            if elapsed >= timeout {
                warn!(
                    operation_id = %handle.operation_id,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Timed out waiting for operation"
                );
                return Ok(TerminalStatus::TimedOut);
            }

            self.clock.sleep(self.interval.min(timeout - elapsed)).await;
        }
    }
}
