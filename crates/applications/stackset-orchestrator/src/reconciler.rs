//! Reconciliation runs
//!
//! Drives one invocation end to end:
//!
//! ```text
//! ensure stack-set ──► observe instances ──► compute plan
//!                                               │
//!         ┌─────────────────────────────────────┘
//!         ▼
//!   for each action, in order:
//!     cancelled? ──yes──► record Cancelled for the rest
//!         │no
//!         ├── serializer.initiate(request)   (waits out conflicts)
//!         ├── poller.await_terminal(handle)
//!         └── record Succeeded / Failed / TimedOut, advance
//! ```
//!
//! A failure on one target never stops the run. Nothing is persisted between
//! runs; a re-run observes the service again and plans only what is still
//! not conformant.

use crate::clock::Clock;
use crate::config::{DeploymentConfig, ReconcilerConfig};
use crate::error::{ReconcileError, Result, ServiceError};
use crate::events::{ProgressEvent, ProgressReporter};
use crate::parameters::ParameterSet;
use crate::plan::{compute_plan, ActionKind, PlanMode, PlanOptions, PlannedAction, ReconciliationPlan};
use crate::poller::{OperationPoller, TerminalStatus};
use crate::serializer::{InitiateError, OperationRequest, OperationSerializer};
use crate::service::{DeploymentService, OperationSummary, StackSetDescription};
use crate::target::{Target, TargetId};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared flag checked between targets
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the current target still runs to completion
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a `deploy` invocation asks for
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Planning mode
    pub mode: PlanMode,

    /// Restrict to one account
    pub account_filter: Option<String>,

    /// Template body to create the stack-set with, or to roll out in update mode
    pub template_body: Option<String>,
}

impl DeployOptions {
    /// Options for a mode
    pub fn new(mode: PlanMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Restrict to one account
    pub fn with_account_filter(mut self, account: impl Into<String>) -> Self {
        self.account_filter = Some(account.into());
        self
    }

    /// Supply a template body
    pub fn with_template(mut self, template_body: impl Into<String>) -> Self {
        self.template_body = Some(template_body.into());
        self
    }
}

/// Service-side state seen at the start of a run
#[derive(Debug, Clone)]
pub struct ObservedState {
    /// The stack-set
    pub stack_set: StackSetDescription,

    /// Existing instances with their overrides and status
    pub instances: Vec<Target>,
}

/// How a target ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Brought into conformance
    Succeeded {
        /// Last operation run for the target
        operation_id: String,
    },
    /// Could not be brought into conformance
    Failed {
        /// Failure reason
        reason: String,
    },
    /// Local wait ran out; the operation may still complete
    TimedOut {
        /// Operation still running server-side
        operation_id: String,
    },
    /// Already conformant
    Skipped,
    /// Not started because the run was cancelled
    Cancelled,
}

/// Outcome of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    /// Target
    pub target: TargetId,

    /// Planned action (none when skipped)
    pub action: Option<ActionKind>,

    /// Outcome
    #[serde(flatten)]
    pub outcome: TargetOutcome,

    /// Initiation attempts across every operation run for the target
    pub attempts: u32,
}

/// Result of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Per-target outcomes; skipped targets first, then planned ones in order
    pub reports: Vec<TargetReport>,

    /// Targets that succeeded
    pub succeeded: usize,

    /// Targets that failed
    pub failed: usize,

    /// Targets already conformant
    pub skipped: usize,

    /// Targets whose outcome is unknown
    pub timed_out: usize,

    /// Targets not started
    pub cancelled: usize,
}

impl RunSummary {
    fn record(&mut self, report: TargetReport) {
        match report.outcome {
            TargetOutcome::Succeeded { .. } => self.succeeded += 1,
            TargetOutcome::Failed { .. } => self.failed += 1,
            TargetOutcome::TimedOut { .. } => self.timed_out += 1,
            TargetOutcome::Skipped => self.skipped += 1,
            TargetOutcome::Cancelled => self.cancelled += 1,
        }
        self.reports.push(report);
    }

    /// True when nothing failed, timed out or was cancelled
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && self.cancelled == 0
    }

    /// Report for a target, if it was part of the run
    pub fn report_for(&self, target: &TargetId) -> Option<&TargetReport> {
        self.reports.iter().find(|r| &r.target == target)
    }

    fn completed_event(&self) -> ProgressEvent {
        ProgressEvent::RunCompleted {
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped,
            timed_out: self.timed_out,
            cancelled: self.cancelled,
        }
    }
}

/// Deployed versus remaining targets, for the status view
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    /// Stack-set name
    pub stack_set_name: String,

    /// Desired targets that have an instance
    pub deployed: Vec<Target>,

    /// Desired targets with no instance yet
    pub remaining: Vec<TargetId>,

    /// Instances that exist but are not in the configuration
    pub unmanaged: Vec<TargetId>,

    /// Operation currently holding the slot, if any
    pub active_operation: Option<OperationSummary>,
}

enum StepOutcome {
    Done { operation_id: String },
    Failed { reason: String },
    TimedOut { operation_id: String },
}

/// Reconciles a stack-set's instances with the desired state
pub struct Reconciler {
    service: Arc<dyn DeploymentService>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ProgressReporter>,
    config: ReconcilerConfig,
    serializer: OperationSerializer,
    poller: OperationPoller,
    cancel: CancelFlag,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        service: Arc<dyn DeploymentService>,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn ProgressReporter>,
        config: ReconcilerConfig,
    ) -> Self {
        let serializer = OperationSerializer::new(
            service.clone(),
            clock.clone(),
            reporter.clone(),
            config.stack_set_name.clone(),
            config.retry.clone(),
        );
        let poller = OperationPoller::new(
            service.clone(),
            clock.clone(),
            config.stack_set_name.clone(),
        )
        .with_interval(config.poll_interval);

        Self {
            service,
            clock,
            reporter,
            config,
            serializer,
            poller,
            cancel: CancelFlag::new(),
        }
    }

    /// Use an externally owned cancellation flag
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Cancellation flag checked between targets
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Describe the stack-set, creating it when absent and a template is given
    pub async fn ensure_stack_set(
        &self,
        template_body: Option<&str>,
        common_parameters: &ParameterSet,
    ) -> Result<StackSetDescription> {
        let name = &self.config.stack_set_name;
        match self.service.describe_stack_set(name).await {
            Ok(description) => Ok(description),
            Err(e) if e.is_not_found() => {
                let Some(template_body) = template_body else {
                    return Err(ReconcileError::StackSetNotFound(name.clone()));
                };

                info!("🆕 Creating StackSet {}", name);
                let stack_set_id = self
                    .service
                    .create_stack_set(name, template_body, common_parameters)
                    .await?;
                debug!(stack_set_id = %stack_set_id, "StackSet created");

                Ok(self.service.describe_stack_set(name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the stack-set and every instance, with overrides
    pub async fn observe(&self, stack_set: StackSetDescription) -> Result<ObservedState> {
        let name = &self.config.stack_set_name;
        let summaries = self.service.list_stack_instances(name).await?;
        let mut instances = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let detail = match self
                .service
                .describe_stack_instance(name, &summary.id.account, &summary.id.region)
                .await
            {
                Ok(detail) => detail,
                // Deleted between the listing and the describe
                Err(e) if e.is_not_found() => {
                    debug!(instance = %summary.id, "Instance vanished during observation");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let mut target = Target::observed(
                summary.id.clone(),
                detail.parameter_overrides,
                summary.observed_status(),
            );
            if let Some(reason) = summary.status_reason {
                target = target.with_status_reason(reason);
            }
            instances.push(target);
        }

        debug!(instances = instances.len(), "Observed stack instances");
        Ok(ObservedState {
            stack_set,
            instances,
        })
    }

    /// Ensure, observe and plan
    pub async fn prepare(
        &self,
        desired: &DeploymentConfig,
        options: &DeployOptions,
    ) -> Result<ReconciliationPlan> {
        check_account_filter(desired, options)?;
        let stack_set = self
            .ensure_stack_set(options.template_body.as_deref(), &desired.common_parameters)
            .await?;
        let observed = self.observe(stack_set).await?;
        let declared = self
            .declared_keys(template_to_apply(options, &observed.stack_set))
            .await;
        Ok(self.plan_against(desired, options, &observed, declared))
    }

    /// Observe and plan without changing anything
    ///
    /// A missing stack-set is planned as empty when a template is given, since
    /// `deploy` would create it.
    pub async fn preview(
        &self,
        desired: &DeploymentConfig,
        options: &DeployOptions,
    ) -> Result<ReconciliationPlan> {
        check_account_filter(desired, options)?;
        let name = &self.config.stack_set_name;
        let (observed, declared) = match self.service.describe_stack_set(name).await {
            Ok(stack_set) => {
                let observed = self.observe(stack_set).await?;
                let declared = self
                    .declared_keys(template_to_apply(options, &observed.stack_set))
                    .await;
                (observed, declared)
            }
            Err(e) if e.is_not_found() && options.template_body.is_some() => {
                info!("StackSet {} does not exist yet; it will be created", name);
                let observed = ObservedState {
                    stack_set: StackSetDescription {
                        name: name.clone(),
                        template_body: options.template_body.clone(),
                        parameters: desired.common_parameters.clone(),
                    },
                    instances: Vec::new(),
                };
                let declared = self.declared_keys(options.template_body.as_deref()).await;
                (observed, declared)
            }
            Err(e) if e.is_not_found() => {
                return Err(ReconcileError::StackSetNotFound(name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.plan_against(desired, options, &observed, declared))
    }

    /// Parameter keys the template declares, `None` if the service cannot say
    ///
    /// Reads `template_body` when given, otherwise the stack-set's current
    /// template.
    async fn declared_keys(&self, template_body: Option<&str>) -> Option<BTreeSet<String>> {
        match self
            .service
            .get_template_summary(&self.config.stack_set_name, template_body)
            .await
        {
            Ok(keys) => {
                debug!(declared = keys.len(), "Read template parameter declarations");
                Some(keys)
            }
            Err(e) => {
                warn!(error = %e, "Could not read template parameters, leaving validation to the service");
                None
            }
        }
    }

    fn plan_against(
        &self,
        desired: &DeploymentConfig,
        options: &DeployOptions,
        observed: &ObservedState,
        declared: Option<BTreeSet<String>>,
    ) -> ReconciliationPlan {
        let mut plan_options = PlanOptions::new(options.mode)
            .with_template_defaults(observed.stack_set.parameters.clone())
            .with_common_parameters(desired.common_parameters.clone());
        if let Some(account) = &options.account_filter {
            plan_options = plan_options.with_account_filter(account.clone());
        }
        if let Some(declared) = declared {
            plan_options = plan_options.with_declared_keys(declared);
        }
        if let Some(template_body) = &options.template_body {
            if observed.stack_set.template_differs(template_body) {
                plan_options = plan_options.with_changed_template(template_body.clone());
            }
        }

        let plan = compute_plan(&desired.targets, &observed.instances, &plan_options);
        info!(
            "📋 Plan: {} create, {} update, {} parameter refresh, {} conformant",
            plan.count(ActionKind::Create),
            plan.count(ActionKind::Update),
            plan.count(ActionKind::UpdateParametersOnly),
            plan.skipped.len()
        );
        plan
    }

    /// Existing instances of an account, optionally in one region
    pub async fn existing_targets(
        &self,
        account: &str,
        region: Option<&str>,
    ) -> Result<Vec<TargetId>> {
        let instances = self
            .service
            .list_stack_instances(&self.config.stack_set_name)
            .await?;
        Ok(instances
            .into_iter()
            .map(|summary| summary.id)
            .filter(|id| id.account == account && region.is_none_or(|r| id.region == r))
            .collect())
    }

    /// Ensure, observe, plan and run
    pub async fn reconcile(
        &self,
        desired: &DeploymentConfig,
        options: &DeployOptions,
    ) -> Result<RunSummary> {
        let plan = self.prepare(desired, options).await?;
        Ok(self.run(&plan).await)
    }

    /// Execute a plan, strictly in order
    pub async fn run(&self, plan: &ReconciliationPlan) -> RunSummary {
        let mut summary = RunSummary::default();

        for target in &plan.skipped {
            summary.record(TargetReport {
                target: target.clone(),
                action: None,
                outcome: TargetOutcome::Skipped,
                attempts: 0,
            });
        }

        for action in &plan.actions {
            if self.cancel.is_cancelled() {
                debug!(instance = %action.target, "Run cancelled, not starting");
                summary.record(TargetReport {
                    target: action.target.clone(),
                    action: Some(action.kind),
                    outcome: TargetOutcome::Cancelled,
                    attempts: 0,
                });
                continue;
            }

            let report = self.run_action(action, plan.declared_keys.as_ref()).await;
            summary.record(report);
        }

        if summary.cancelled > 0 {
            warn!(
                cancelled = summary.cancelled,
                "Run cancelled; remaining targets were not started"
            );
        }
        self.reporter.report(&summary.completed_event());
        summary
    }

    /// Delete instances one at a time
    pub async fn remove(&self, targets: &[TargetId], retain_stacks: bool) -> RunSummary {
        let mut summary = RunSummary::default();
        for target in targets {
            let action = PlannedAction {
                target: target.clone(),
                kind: ActionKind::Delete,
                overrides: ParameterSet::new(),
                template_body: None,
                stack_set_parameters: ParameterSet::new(),
                changed_keys: Vec::new(),
            };
            if self.cancel.is_cancelled() {
                summary.record(TargetReport {
                    target: action.target.clone(),
                    action: Some(ActionKind::Delete),
                    outcome: TargetOutcome::Cancelled,
                    attempts: 0,
                });
                continue;
            }

            self.reporter.report(&ProgressEvent::TargetStarted {
                account: action.target.account.clone(),
                region: action.target.region.clone(),
                action: ActionKind::Delete,
            });
            let request = OperationRequest::DeleteInstances {
                target: action.target.clone(),
                retain_stacks,
            };
            let mut attempts = 0;
            let outcome = self.step(&request, &mut attempts).await;
            summary.record(self.finish(&action, outcome, attempts));
        }

        self.reporter.report(&summary.completed_event());
        summary
    }

    /// Desired targets split into deployed and remaining
    pub async fn status(&self, desired: &DeploymentConfig) -> Result<DeploymentStatus> {
        let name = &self.config.stack_set_name;
        let stack_set = self.service.describe_stack_set(name).await.map_err(|e| {
            if e.is_not_found() {
                ReconcileError::StackSetNotFound(name.clone())
            } else {
                e.into()
            }
        })?;
        let observed = self.observe(stack_set).await?;

        let wanted: HashSet<&TargetId> = desired.targets.iter().map(|t| &t.id).collect();
        let existing: HashSet<&TargetId> = observed.instances.iter().map(|t| &t.id).collect();

        let deployed = observed
            .instances
            .iter()
            .filter(|t| wanted.contains(&t.id))
            .cloned()
            .collect();
        let remaining = desired
            .targets
            .iter()
            .filter(|t| !existing.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        let unmanaged = observed
            .instances
            .iter()
            .filter(|t| !wanted.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();

        let active_operation = match self.service.list_stack_set_operations(name).await {
            Ok(operations) => operations.into_iter().find(|op| op.status.is_active()),
            Err(e) => {
                warn!(error = %e, "Could not list operations");
                None
            }
        };

        Ok(DeploymentStatus {
            stack_set_name: name.clone(),
            deployed,
            remaining,
            unmanaged,
            active_operation,
        })
    }

    async fn run_action(
        &self,
        action: &PlannedAction,
        declared_keys: Option<&BTreeSet<String>>,
    ) -> TargetReport {
        let target = &action.target;
        self.reporter.report(&ProgressEvent::TargetStarted {
            account: target.account.clone(),
            region: target.region.clone(),
            action: action.kind,
        });

        if let Some(declared) = declared_keys {
            let undeclared = action.overrides.undeclared_keys(declared);
            if !undeclared.is_empty() {
                let error = ServiceError::validation(format!(
                    "parameters not declared by the template: {}",
                    undeclared.join(", ")
                ));
                return self.finish(
                    action,
                    StepOutcome::Failed {
                        reason: error.to_string(),
                    },
                    0,
                );
            }
        }

        let mut requests = Vec::with_capacity(2);
        if let Some(template_body) = &action.template_body {
            // Values for keys the new template dropped would be rejected
            let parameters = match declared_keys {
                Some(declared) => action.stack_set_parameters.only_declared(declared),
                None => action.stack_set_parameters.clone(),
            };
            requests.push(OperationRequest::UpdateStackSet {
                target: target.clone(),
                template_body: template_body.clone(),
                parameters,
            });
        }
        if action.pushes_overrides() {
            let overrides = action.overrides.clone();
            requests.push(match action.kind {
                ActionKind::Create => OperationRequest::CreateInstances {
                    target: target.clone(),
                    overrides,
                },
                _ => OperationRequest::UpdateInstances {
                    target: target.clone(),
                    overrides,
                },
            });
        }

        let mut attempts = 0;
        let mut outcome = StepOutcome::Failed {
            reason: "nothing to do".to_string(),
        };
        for request in &requests {
            outcome = self.step(request, &mut attempts).await;
            if !matches!(outcome, StepOutcome::Done { .. }) {
                break;
            }
        }

        self.finish(action, outcome, attempts)
    }

    /// Initiate one operation and wait for it
    async fn step(&self, request: &OperationRequest, attempts: &mut u32) -> StepOutcome {
        let handle = match self.serializer.initiate(request).await {
            Ok(handle) => handle,
            Err(e) => {
                *attempts += e.attempts();
                let reason = match &e {
                    InitiateError::Fatal { error, .. } => error.to_string(),
                    InitiateError::Exhausted { .. } => e.to_string(),
                };
                return StepOutcome::Failed { reason };
            }
        };
        *attempts += handle.attempts;

        let started = self.clock.now();
        match self
            .poller
            .await_terminal(&handle, self.config.poll_timeout)
            .await
        {
            Ok(TerminalStatus::Succeeded) => {
                debug!(
                    operation_id = %handle.operation_id,
                    elapsed_secs = self.clock.elapsed_since(started).as_secs_f64(),
                    "Step complete"
                );
                StepOutcome::Done {
                    operation_id: handle.operation_id,
                }
            }
            Ok(TerminalStatus::Failed { reason }) => StepOutcome::Failed {
                reason: format!(
                    "operation {} failed: {}",
                    handle.operation_id,
                    reason.unwrap_or_else(|| "no reason given".to_string())
                ),
            },
            Ok(TerminalStatus::Stopped { reason }) => StepOutcome::Failed {
                reason: format!(
                    "operation {} stopped: {}",
                    handle.operation_id,
                    reason.unwrap_or_else(|| "no reason given".to_string())
                ),
            },
            Ok(TerminalStatus::TimedOut) => StepOutcome::TimedOut {
                operation_id: handle.operation_id,
            },
            Err(e) => StepOutcome::Failed {
                reason: format!("lost track of operation {}: {}", handle.operation_id, e),
            },
        }
    }

    fn finish(&self, action: &PlannedAction, outcome: StepOutcome, attempts: u32) -> TargetReport {
        let target = &action.target;
        let (event, outcome) = match outcome {
            StepOutcome::Done { operation_id } => (
                ProgressEvent::TargetSucceeded {
                    account: target.account.clone(),
                    region: target.region.clone(),
                },
                TargetOutcome::Succeeded { operation_id },
            ),
            StepOutcome::Failed { reason } => (
                ProgressEvent::TargetFailed {
                    account: target.account.clone(),
                    region: target.region.clone(),
                    reason: reason.clone(),
                },
                TargetOutcome::Failed { reason },
            ),
            StepOutcome::TimedOut { operation_id } => (
                ProgressEvent::TargetTimedOut {
                    account: target.account.clone(),
                    region: target.region.clone(),
                    operation_id: operation_id.clone(),
                },
                TargetOutcome::TimedOut { operation_id },
            ),
        };
        self.reporter.report(&event);

        TargetReport {
            target: target.clone(),
            action: Some(action.kind),
            outcome,
            attempts,
        }
    }
}

/// Template the run will roll out, when update mode brings a changed one
fn template_to_apply<'a>(
    options: &'a DeployOptions,
    stack_set: &StackSetDescription,
) -> Option<&'a str> {
    options
        .template_body
        .as_deref()
        .filter(|body| options.mode == PlanMode::Update && stack_set.template_differs(body))
}

fn check_account_filter(desired: &DeploymentConfig, options: &DeployOptions) -> Result<()> {
    match &options.account_filter {
        Some(account) if !desired.has_account(account) => Err(ReconcileError::config(format!(
            "account {} is not in the configuration",
            account
        ))),
        _ => Ok(()),
    }
}
