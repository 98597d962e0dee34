//! Deployment service interface
//!
//! The reconciler talks to the stack-set service only through
//! [`DeploymentService`]. [`CloudFormationClient`](crate::cloudformation::CloudFormationClient)
//! is the production implementation; tests use in-memory fakes.
//!
//! Operation-starting calls (`update_stack_set` and the three instance calls)
//! return the operation ID. They accept a client-proposed ID so a retried
//! request can be told apart from its predecessor.

use crate::error::ServiceResult;
use crate::parameters::ParameterSet;
use crate::target::{ObservedStatus, TargetId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of work an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create stack instances
    Create,
    /// Update the stack-set or its instances
    Update,
    /// Delete stack instances
    Delete,
    /// Drift detection started outside this tool
    DetectDrift,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::DetectDrift => "DETECT_DRIFT",
        };
        f.write_str(name)
    }
}

/// Status of a stack-set operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Accepted, waiting for the slot
    Queued,
    /// Executing
    Running,
    /// Stop requested, still executing
    Stopping,
    /// Completed successfully
    Succeeded,
    /// Completed with failures beyond tolerance
    Failed,
    /// Stopped on request
    Stopped,
}

impl OperationStatus {
    /// Parse the service's status string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the operation has finished
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Succeeded | Self::Failed | Self::Stopped => true,
            Self::Queued | Self::Running | Self::Stopping => false,
        }
    }

    /// Whether the operation still holds the stack-set's operation slot
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Summary of a stack-set operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    /// Operation ID
    pub operation_id: String,
    /// Operation kind, when reported
    pub kind: Option<OperationKind>,
    /// Current status
    pub status: OperationStatus,
    /// Reason for the status, when reported
    pub status_reason: Option<String>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

/// Stack-set as described by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackSetDescription {
    /// Stack-set name
    pub name: String,
    /// Template body currently applied to the stack-set
    pub template_body: Option<String>,
    /// Stack-set level parameter values
    pub parameters: ParameterSet,
}

impl StackSetDescription {
    /// Whether `template_body` differs from the applied template
    pub fn template_differs(&self, template_body: &str) -> bool {
        self.template_body.as_deref().map(str::trim) != Some(template_body.trim())
    }
}

/// Instance status reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Up to date with the stack-set
    Current,
    /// Not yet updated to the latest stack-set template or parameters
    Outdated,
    /// Detached or unrecoverable
    Inoperable,
}

impl InstanceStatus {
    /// Parse the service's status string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CURRENT" => Some(Self::Current),
            "OUTDATED" => Some(Self::Outdated),
            "INOPERABLE" => Some(Self::Inoperable),
            _ => None,
        }
    }
}

/// One row of `list_stack_instances`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackInstanceSummary {
    /// Identity
    pub id: TargetId,
    /// Reported status
    pub status: InstanceStatus,
    /// Whether the last operation on this instance failed
    pub last_operation_failed: bool,
    /// Reported reason
    pub status_reason: Option<String>,
}

impl StackInstanceSummary {
    /// Collapse service status into the reconciler's observed status
    pub fn observed_status(&self) -> ObservedStatus {
        match (self.status, self.last_operation_failed) {
            (InstanceStatus::Inoperable, _) | (_, true) => ObservedStatus::Failing,
            (InstanceStatus::Outdated, false) => ObservedStatus::Drifted,
            (InstanceStatus::Current, false) => ObservedStatus::Deployed,
        }
    }
}

/// Result of `describe_stack_instance`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackInstanceDetail {
    /// Summary fields
    pub summary: StackInstanceSummary,
    /// Overrides currently applied to the instance
    pub parameter_overrides: ParameterSet,
}

/// Request shared by the create and update instance calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancesRequest {
    /// Stack-set name
    pub stack_set_name: String,
    /// Target accounts
    pub accounts: Vec<String>,
    /// Target regions
    pub regions: Vec<String>,
    /// Overrides to apply
    pub parameter_overrides: ParameterSet,
    /// Client-proposed operation ID
    pub operation_id: String,
}

/// Request for `update_stack_set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSetUpdate {
    /// Stack-set name
    pub stack_set_name: String,
    /// New template body
    pub template_body: String,
    /// Stack-set level parameter values
    pub parameters: ParameterSet,
    /// Accounts to roll the update out to
    pub accounts: Vec<String>,
    /// Regions to roll the update out to
    pub regions: Vec<String>,
    /// Client-proposed operation ID
    pub operation_id: String,
}

/// Request for `delete_stack_instances`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteInstancesRequest {
    /// Stack-set name
    pub stack_set_name: String,
    /// Target accounts
    pub accounts: Vec<String>,
    /// Target regions
    pub regions: Vec<String>,
    /// Keep the underlying stacks after removing them from the stack-set
    pub retain_stacks: bool,
    /// Client-proposed operation ID
    pub operation_id: String,
}

/// The managed stack-set API surface
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Create a stack-set (synchronous; returns the stack-set ID)
    async fn create_stack_set(
        &self,
        name: &str,
        template_body: &str,
        parameters: &ParameterSet,
    ) -> ServiceResult<String>;

    /// Update a stack-set's template, rolled out to the given instances
    async fn update_stack_set(&self, request: &StackSetUpdate) -> ServiceResult<String>;

    /// Create stack instances
    async fn create_stack_instances(&self, request: &InstancesRequest) -> ServiceResult<String>;

    /// Update parameter overrides of existing stack instances
    async fn update_stack_instances(&self, request: &InstancesRequest) -> ServiceResult<String>;

    /// Delete stack instances
    async fn delete_stack_instances(&self, request: &DeleteInstancesRequest)
    -> ServiceResult<String>;

    /// Parameter keys declared by `template_body`, or by the stack-set's
    /// current template when `None`
    async fn get_template_summary(
        &self,
        name: &str,
        template_body: Option<&str>,
    ) -> ServiceResult<BTreeSet<String>>;

    /// Describe a stack-set
    async fn describe_stack_set(&self, name: &str) -> ServiceResult<StackSetDescription>;

    /// List all instances of a stack-set
    async fn list_stack_instances(&self, name: &str) -> ServiceResult<Vec<StackInstanceSummary>>;

    /// Describe one instance, including its parameter overrides
    async fn describe_stack_instance(
        &self,
        name: &str,
        account: &str,
        region: &str,
    ) -> ServiceResult<StackInstanceDetail>;

    /// List operations, most recent first
    async fn list_stack_set_operations(&self, name: &str) -> ServiceResult<Vec<OperationSummary>>;

    /// Describe one operation
    async fn describe_stack_set_operation(
        &self,
        name: &str,
        operation_id: &str,
    ) -> ServiceResult<OperationSummary>;
}
