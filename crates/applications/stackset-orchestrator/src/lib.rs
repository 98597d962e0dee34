//! # StackSet Orchestrator
//!
//! Drives a CloudFormation StackSet toward a declared set of
//! (account, region) stack instances.
//!
//! ## Architecture
//!
//! ```text
//! account-parameters.json ──► Reconciler ──► plan (ordered actions)
//!                                 │
//!                                 ├── OperationSerializer   one operation at a time,
//!                                 │                          waits out conflicts
//!                                 ├── OperationPoller        waits for a terminal status
//!                                 └── ProgressReporter       structured events
//!                                 │
//!                          DeploymentService (CloudFormation)
//! ```
//!
//! The service allows one running operation per stack-set. Everything that
//! initiates work goes through the [`serializer`], which treats "operation in
//! progress" as a wait condition rather than a failure.
//!
//! ## Resumability
//!
//! No state is kept between runs. Each run observes the stack-set, computes a
//! fresh plan and skips targets that already conform, so re-running after a
//! partial failure picks up where the last run stopped.
//!
//! See [`reconciler`] and [`plan`] for details.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod cloudformation;
pub mod config;
pub mod error;
pub mod events;
pub mod parameters;
pub mod plan;
pub mod poller;
pub mod reconciler;
pub mod retry;
pub mod serializer;
pub mod service;
pub mod target;

// ============================================================================
// Public exports - Reconciliation
// ============================================================================

// Reconciler
pub use reconciler::{
    CancelFlag, DeployOptions, DeploymentStatus, ObservedState, Reconciler, RunSummary,
    TargetOutcome, TargetReport,
};

// Planning
pub use plan::{compute_plan, ActionKind, PlanMode, PlanOptions, PlannedAction, ReconciliationPlan};

// Operation handling
pub use poller::{OperationPoller, TerminalStatus};
pub use serializer::{InitiateError, OperationHandle, OperationRequest, OperationSerializer};

// ============================================================================
// Public exports - Core types
// ============================================================================

// Error handling
pub use error::{ErrorClass, ReconcileError, Result, ServiceError, ServiceErrorKind};

// Configuration
pub use config::{DeploymentConfig, ReconcilerConfig};
pub use retry::{Backoff, RetryPolicy};

// Data model
pub use parameters::{merge, Parameter, ParameterSet};
pub use target::{ObservedStatus, Target, TargetId};

// Service boundary
pub use clock::{Clock, ManualClock, SystemClock};
pub use cloudformation::{ClientConfig, CloudFormationClient};
pub use events::{JsonLinesReporter, MemoryReporter, ProgressEvent, ProgressReporter, TracingReporter};
pub use service::DeploymentService;
