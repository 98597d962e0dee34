//! Operation serialization
//!
//! The service runs at most one operation per stack-set. The serializer is the
//! only component that contends for that slot, and it issues initiations one
//! at a time:
//!
//! ```text
//! attempt ──► slot busy? ──yes──► Conflict ──► backoff ──► attempt
//!                 │no
//!                 ▼
//!            issue call ──► Ok(operation id)
//!                 │
//!                 └──► error ──► Conflict   ──► backoff ──► attempt
//!                           ├──► Transient  ──► backoff ──► attempt
//!                           └──► Fatal      ──► return
//! ```
//!
//! Each error class has its own attempt limit. All waits for one request
//! share the policy's `max_wait` budget.
//!
//! Every attempt for one request carries the same client-proposed operation
//! ID. If an earlier attempt was accepted but its response was lost, the next
//! attempt finds that operation (listed as active, or rejected as an ID
//! already in use) and adopts it instead of starting a second one.

use crate::clock::Clock;
use crate::error::{ErrorClass, ServiceError, ServiceErrorKind, ServiceResult};
use crate::events::{ProgressEvent, ProgressReporter};
use crate::parameters::ParameterSet;
use crate::retry::RetryPolicy;
use crate::service::{
    DeleteInstancesRequest, DeploymentService, InstancesRequest, OperationKind, OperationSummary,
    StackSetUpdate,
};
use crate::target::TargetId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One operation the reconciler wants started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    /// Create the instance with the given overrides
    CreateInstances {
        /// Target
        target: TargetId,
        /// Overrides
        overrides: ParameterSet,
    },
    /// Re-push overrides to an existing instance
    UpdateInstances {
        /// Target
        target: TargetId,
        /// Overrides
        overrides: ParameterSet,
    },
    /// Roll a new template out to the instance
    UpdateStackSet {
        /// Target
        target: TargetId,
        /// Template body
        template_body: String,
        /// Stack-set level values
        parameters: ParameterSet,
    },
    /// Delete the instance
    DeleteInstances {
        /// Target
        target: TargetId,
        /// Keep the underlying stack
        retain_stacks: bool,
    },
}

impl OperationRequest {
    /// Kind of operation this request starts
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateInstances { .. } => OperationKind::Create,
            Self::UpdateInstances { .. } | Self::UpdateStackSet { .. } => OperationKind::Update,
            Self::DeleteInstances { .. } => OperationKind::Delete,
        }
    }

    /// Target affected
    pub fn target(&self) -> &TargetId {
        match self {
            Self::CreateInstances { target, .. }
            | Self::UpdateInstances { target, .. }
            | Self::UpdateStackSet { target, .. }
            | Self::DeleteInstances { target, .. } => target,
        }
    }
}

/// An operation accepted by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationHandle {
    /// Operation ID assigned by the service
    pub operation_id: String,
    /// Kind of operation
    pub kind: OperationKind,
    /// Target affected
    pub target: TargetId,
    /// When the accepted attempt was issued
    pub started_at: DateTime<Utc>,
    /// Attempts made, including the accepted one
    pub attempts: u32,
}

/// Why an operation could not be started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitiateError {
    /// Rejected outright; not retried
    #[error("{error}")]
    Fatal {
        /// Service error
        error: ServiceError,
        /// Attempts made
        attempts: u32,
    },

    /// Retry budget used up on conflicts or transient errors
    #[error("gave up after {attempts} attempts ({waited:?} waited): {last}")]
    Exhausted {
        /// Last error seen
        last: ServiceError,
        /// Attempts made
        attempts: u32,
        /// Total backoff waited
        waited: Duration,
    },
}

impl InitiateError {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Serializes operation initiation against one stack-set
pub struct OperationSerializer {
    service: Arc<dyn DeploymentService>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ProgressReporter>,
    stack_set_name: String,
    policy: RetryPolicy,
}

impl OperationSerializer {
    /// Create a serializer for a stack-set
    pub fn new(
        service: Arc<dyn DeploymentService>,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ProgressReporter>,
        stack_set_name: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            clock,
            reporter,
            stack_set_name: stack_set_name.into(),
            policy,
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start an operation, waiting out conflicts and transient errors
    pub async fn initiate(
        &self,
        request: &OperationRequest,
    ) -> std::result::Result<OperationHandle, InitiateError> {
        let target = request.target();
        let operation_id = uuid::Uuid::new_v4().to_string();
        let mut issued = false;
        let mut attempts = 0u32;
        let mut conflicts = 0u32;
        let mut transients = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            attempts += 1;
            let issued_at = self.clock.now();

            let outcome = match self.active_operation().await {
                Some(active) if active.operation_id == operation_id => {
                    debug!(
                        instance = %target,
                        operation_id = %operation_id,
                        "Earlier attempt was accepted, adopting its operation"
                    );
                    Ok(operation_id.clone())
                }
                Some(active) => Err(ServiceError::conflict(format!(
                    "operation {} is {}",
                    active.operation_id, active.status
                ))),
                None => {
                    let reissue = issued;
                    issued = true;
                    match self.issue(request, &operation_id).await {
                        Err(e) if reissue && e.kind == ServiceErrorKind::OperationIdInUse => {
                            debug!(
                                instance = %target,
                                operation_id = %operation_id,
                                "Operation ID already accepted by an earlier attempt"
                            );
                            Ok(operation_id.clone())
                        }
                        other => other,
                    }
                }
            };

            let error = match outcome {
                Ok(accepted_id) => {
                    info!(
                        instance = %target,
                        operation_id = %accepted_id,
                        attempts,
                        "Operation initiated"
                    );
                    return Ok(OperationHandle {
                        operation_id: accepted_id,
                        kind: request.kind(),
                        target: target.clone(),
                        started_at: issued_at,
                        attempts,
                    });
                }
                Err(error) => error,
            };

            let (delay, exhausted) = match error.class() {
                ErrorClass::Fatal => {
                    warn!(instance = %target, error = %error, "Operation rejected");
                    return Err(InitiateError::Fatal { error, attempts });
                }
                ErrorClass::Conflict => {
                    conflicts += 1;
                    (
                        self.policy.conflict_backoff.delay_for_attempt(conflicts),
                        conflicts >= self.policy.max_conflict_attempts,
                    )
                }
                ErrorClass::Transient => {
                    transients += 1;
                    (
                        self.policy.transient_backoff.delay_for_attempt(transients),
                        transients >= self.policy.max_transient_attempts,
                    )
                }
            };

            if exhausted || waited + delay > self.policy.max_wait {
                warn!(
                    instance = %target,
                    attempts,
                    waited_secs = waited.as_secs_f64(),
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(InitiateError::Exhausted {
                    last: error,
                    attempts,
                    waited,
                });
            }

            let event = match error.class() {
                ErrorClass::Conflict => ProgressEvent::ConflictRetry {
                    account: target.account.clone(),
                    region: target.region.clone(),
                    attempt: attempts,
                    delay_secs: delay.as_secs_f64(),
                },
                _ => ProgressEvent::TransientRetry {
                    account: target.account.clone(),
                    region: target.region.clone(),
                    attempt: attempts,
                    delay_secs: delay.as_secs_f64(),
                    reason: error.to_string(),
                },
            };
            self.reporter.report(&event);

            self.clock.sleep(delay).await;
            waited += delay;
        }
    }

    /// The operation currently holding the slot, if any
    ///
    /// A failed listing is not a conflict; the call itself will tell.
    async fn active_operation(&self) -> Option<OperationSummary> {
        match self
            .service
            .list_stack_set_operations(&self.stack_set_name)
            .await
        {
            Ok(operations) => operations.into_iter().find(|op| op.status.is_active()),
            Err(e) => {
                debug!(error = %e, "Could not list operations, attempting anyway");
                None
            }
        }
    }

    async fn issue(&self, request: &OperationRequest, operation_id: &str) -> ServiceResult<String> {
        let operation_id = operation_id.to_string();
        let stack_set_name = self.stack_set_name.clone();

        debug!(
            kind = %request.kind(),
            instance = %request.target(),
            operation_id = %operation_id,
            "Issuing operation"
        );

        match request {
            OperationRequest::CreateInstances { target, overrides } => {
                self.service
                    .create_stack_instances(&InstancesRequest {
                        stack_set_name,
                        accounts: vec![target.account.clone()],
                        regions: vec![target.region.clone()],
                        parameter_overrides: overrides.clone(),
                        operation_id,
                    })
                    .await
            }
            OperationRequest::UpdateInstances { target, overrides } => {
                self.service
                    .update_stack_instances(&InstancesRequest {
                        stack_set_name,
                        accounts: vec![target.account.clone()],
                        regions: vec![target.region.clone()],
                        parameter_overrides: overrides.clone(),
                        operation_id,
                    })
                    .await
            }
            OperationRequest::UpdateStackSet {
                target,
                template_body,
                parameters,
            } => {
                self.service
                    .update_stack_set(&StackSetUpdate {
                        stack_set_name,
                        template_body: template_body.clone(),
                        parameters: parameters.clone(),
                        accounts: vec![target.account.clone()],
                        regions: vec![target.region.clone()],
                        operation_id,
                    })
                    .await
            }
            OperationRequest::DeleteInstances {
                target,
                retain_stacks,
            } => {
                self.service
                    .delete_stack_instances(&DeleteInstancesRequest {
                        stack_set_name,
                        accounts: vec![target.account.clone()],
                        regions: vec![target.region.clone()],
                        retain_stacks: *retain_stacks,
                        operation_id,
                    })
                    .await
            }
        }
    }
}
