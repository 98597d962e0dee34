//! In-memory stack-set service for driving the reconciler in tests

#![allow(dead_code)]

use async_trait::async_trait;
use stackset_orchestrator::error::{ServiceError, ServiceErrorKind, ServiceResult};
use stackset_orchestrator::service::{
    DeleteInstancesRequest, InstanceStatus, InstancesRequest, OperationKind, OperationStatus,
    OperationSummary, StackInstanceDetail, StackInstanceSummary, StackSetDescription,
    StackSetUpdate,
};
use stackset_orchestrator::{
    Clock, DeploymentConfig, DeploymentService, ManualClock, MemoryReporter, ParameterSet,
    Reconciler, ReconcilerConfig, RetryPolicy, TargetId,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STACK_SET: &str = "StackSet-Name";

/// How an operation touching a target ends
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeeds after this many RUNNING polls
    Succeed { running_polls: u32 },
    /// Fails with a reason on the first poll
    Fail { reason: String },
    /// Stopped with a reason on the first poll
    Stop { reason: String },
    /// Never leaves RUNNING
    Hang,
}

impl Default for Behavior {
    fn default() -> Self {
        Self::Succeed { running_polls: 1 }
    }
}

/// Every call the fake received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateStackSet,
    UpdateStackSet(TargetId),
    CreateInstances(TargetId),
    UpdateInstances(TargetId),
    DeleteInstances(TargetId),
    ListOperations,
    DescribeOperation(String),
}

#[derive(Debug, Clone)]
struct Instance {
    status: InstanceStatus,
    last_operation_failed: bool,
    overrides: ParameterSet,
}

#[derive(Debug, Clone)]
enum Effect {
    Create(TargetId, ParameterSet),
    Update(TargetId, ParameterSet),
    Template(TargetId, String),
    Delete(TargetId),
}

#[derive(Debug)]
struct Operation {
    summary: OperationSummary,
    behavior: Behavior,
    effect: Effect,
}

#[derive(Debug, Default)]
struct State {
    stack_set: Option<StackSetDescription>,
    instances: BTreeMap<TargetId, Instance>,
    operations: Vec<Operation>,
    behaviors: HashMap<TargetId, Behavior>,
    initiate_errors: VecDeque<ServiceError>,
    describe_errors: VecDeque<ServiceError>,
    lost_responses: u32,
    busy_listings: u32,
    templates: HashMap<String, BTreeSet<String>>,
    calls: Vec<Call>,
    proposed_ids: Vec<String>,
}

/// Scripted [`DeploymentService`]
#[derive(Debug, Default)]
pub struct FakeService {
    state: Mutex<State>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service with an existing stack-set
    pub fn with_stack_set(template_body: &str, parameters: ParameterSet) -> Self {
        let service = Self::new();
        service.state().stack_set = Some(StackSetDescription {
            name: STACK_SET.to_string(),
            template_body: Some(template_body.to_string()),
            parameters,
        });
        service
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add an instance that is already deployed
    pub fn add_instance(&self, id: TargetId, overrides: ParameterSet, status: InstanceStatus) {
        self.state().instances.insert(
            id,
            Instance {
                status,
                last_operation_failed: false,
                overrides,
            },
        );
    }

    /// Mark an instance's last operation as failed
    pub fn mark_failed(&self, id: &TargetId) {
        if let Some(instance) = self.state().instances.get_mut(id) {
            instance.last_operation_failed = true;
        }
    }

    /// Script how operations on a target end
    pub fn set_behavior(&self, id: TargetId, behavior: Behavior) {
        self.state().behaviors.insert(id, behavior);
    }

    /// Reject the next initiating calls with these errors, in order
    pub fn push_initiate_errors(&self, errors: impl IntoIterator<Item = ServiceError>) {
        self.state().initiate_errors.extend(errors);
    }

    /// Accept the next `n` initiations but answer them with a network error
    pub fn lose_responses(&self, n: u32) {
        self.state().lost_responses = n;
    }

    /// Fail the next operation status queries with these errors, in order
    pub fn push_describe_errors(&self, errors: impl IntoIterator<Item = ServiceError>) {
        self.state().describe_errors.extend(errors);
    }

    /// Register the parameter keys a template body declares
    pub fn declare_template(&self, template_body: &str, keys: &[&str]) {
        self.state().templates.insert(
            template_body.trim().to_string(),
            keys.iter().map(|k| k.to_string()).collect(),
        );
    }

    /// Operation IDs sent with each initiating call, in order
    pub fn proposed_ids(&self) -> Vec<String> {
        self.state().proposed_ids.clone()
    }

    /// Report a foreign RUNNING operation on the next `n` listings
    pub fn busy_for_listings(&self, n: u32) {
        self.state().busy_listings = n;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Initiating calls only, in order
    pub fn initiations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::ListOperations | Call::DescribeOperation(_)))
            .collect()
    }

    pub fn instance_ids(&self) -> Vec<TargetId> {
        self.state().instances.keys().cloned().collect()
    }

    pub fn overrides_of(&self, id: &TargetId) -> Option<ParameterSet> {
        self.state().instances.get(id).map(|i| i.overrides.clone())
    }

    pub fn template_body(&self) -> Option<String> {
        self.state().stack_set.as_ref().and_then(|s| s.template_body.clone())
    }

    fn start(
        &self,
        call: Call,
        id: &TargetId,
        operation_id: &str,
        kind: OperationKind,
        effect: Effect,
    ) -> ServiceResult<String> {
        let mut state = self.state();
        state.calls.push(call);
        state.proposed_ids.push(operation_id.to_string());

        if let Some(error) = state.initiate_errors.pop_front() {
            return Err(error);
        }
        if state.stack_set.is_none() {
            return Err(ServiceError::from_code(
                "StackSetNotFoundException",
                format!("StackSet {} not found", STACK_SET),
            ));
        }
        if state
            .operations
            .iter()
            .any(|op| op.summary.operation_id == operation_id)
        {
            return Err(ServiceError::from_code(
                "OperationIdAlreadyExistsException",
                format!("The specified operation ID already exists: {}", operation_id),
            ));
        }

        let operation_id = operation_id.to_string();
        let behavior = state.behaviors.get(id).cloned().unwrap_or_default();
        state.operations.push(Operation {
            summary: OperationSummary {
                operation_id: operation_id.clone(),
                kind: Some(kind),
                status: OperationStatus::Running,
                status_reason: None,
                created_at: None,
            },
            behavior,
            effect,
        });

        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(ServiceError::network("connection reset after request was sent"));
        }
        Ok(operation_id)
    }
}

fn apply(state: &mut State, effect: &Effect, failed: bool) {
    match effect {
        Effect::Create(id, overrides) => {
            state.instances.insert(
                id.clone(),
                Instance {
                    status: if failed {
                        InstanceStatus::Outdated
                    } else {
                        InstanceStatus::Current
                    },
                    last_operation_failed: failed,
                    overrides: overrides.clone(),
                },
            );
        }
        Effect::Update(id, overrides) => {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.last_operation_failed = failed;
                if !failed {
                    instance.overrides = overrides.clone();
                    instance.status = InstanceStatus::Current;
                }
            }
        }
        Effect::Template(id, body) => {
            if failed {
                if let Some(instance) = state.instances.get_mut(id) {
                    instance.last_operation_failed = true;
                }
            } else if let Some(stack_set) = state.stack_set.as_mut() {
                stack_set.template_body = Some(body.clone());
            }
        }
        Effect::Delete(id) => {
            if !failed {
                state.instances.remove(id);
            }
        }
    }
}

#[async_trait]
impl DeploymentService for FakeService {
    async fn create_stack_set(
        &self,
        name: &str,
        template_body: &str,
        parameters: &ParameterSet,
    ) -> ServiceResult<String> {
        let mut state = self.state();
        state.calls.push(Call::CreateStackSet);
        if state.stack_set.is_some() {
            return Err(ServiceError::from_code("NameAlreadyExistsException", name));
        }
        state.stack_set = Some(StackSetDescription {
            name: name.to_string(),
            template_body: Some(template_body.to_string()),
            parameters: parameters.clone(),
        });
        Ok(format!("{}:1", name))
    }

    async fn update_stack_set(&self, request: &StackSetUpdate) -> ServiceResult<String> {
        let id = TargetId::new(request.accounts[0].clone(), request.regions[0].clone());
        self.start(
            Call::UpdateStackSet(id.clone()),
            &id,
            &request.operation_id,
            OperationKind::Update,
            Effect::Template(id.clone(), request.template_body.clone()),
        )
    }

    async fn create_stack_instances(&self, request: &InstancesRequest) -> ServiceResult<String> {
        let id = TargetId::new(request.accounts[0].clone(), request.regions[0].clone());
        self.start(
            Call::CreateInstances(id.clone()),
            &id,
            &request.operation_id,
            OperationKind::Create,
            Effect::Create(id.clone(), request.parameter_overrides.clone()),
        )
    }

    async fn update_stack_instances(&self, request: &InstancesRequest) -> ServiceResult<String> {
        let id = TargetId::new(request.accounts[0].clone(), request.regions[0].clone());
        self.start(
            Call::UpdateInstances(id.clone()),
            &id,
            &request.operation_id,
            OperationKind::Update,
            Effect::Update(id.clone(), request.parameter_overrides.clone()),
        )
    }

    async fn delete_stack_instances(
        &self,
        request: &DeleteInstancesRequest,
    ) -> ServiceResult<String> {
        let id = TargetId::new(request.accounts[0].clone(), request.regions[0].clone());
        self.start(
            Call::DeleteInstances(id.clone()),
            &id,
            &request.operation_id,
            OperationKind::Delete,
            Effect::Delete(id.clone()),
        )
    }

    async fn get_template_summary(
        &self,
        _name: &str,
        template_body: Option<&str>,
    ) -> ServiceResult<BTreeSet<String>> {
        let state = self.state();
        let body = match template_body {
            Some(body) => Some(body.to_string()),
            None => state.stack_set.as_ref().and_then(|s| s.template_body.clone()),
        };
        body.and_then(|b| state.templates.get(b.trim()).cloned())
            .ok_or_else(|| ServiceError::validation("Template format error: unrecognized template"))
    }

    async fn describe_stack_set(&self, name: &str) -> ServiceResult<StackSetDescription> {
        self.state().stack_set.clone().ok_or_else(|| {
            ServiceError::from_code("StackSetNotFoundException", format!("StackSet {} not found", name))
        })
    }

    async fn list_stack_instances(&self, _name: &str) -> ServiceResult<Vec<StackInstanceSummary>> {
        Ok(self
            .state()
            .instances
            .iter()
            .map(|(id, instance)| StackInstanceSummary {
                id: id.clone(),
                status: instance.status,
                last_operation_failed: instance.last_operation_failed,
                status_reason: None,
            })
            .collect())
    }

    async fn describe_stack_instance(
        &self,
        _name: &str,
        account: &str,
        region: &str,
    ) -> ServiceResult<StackInstanceDetail> {
        let id = TargetId::new(account, region);
        let state = self.state();
        let instance = state.instances.get(&id).ok_or_else(|| {
            ServiceError::new(ServiceErrorKind::InstanceNotFound, id.to_string())
        })?;
        Ok(StackInstanceDetail {
            summary: StackInstanceSummary {
                id: id.clone(),
                status: instance.status,
                last_operation_failed: instance.last_operation_failed,
                status_reason: None,
            },
            parameter_overrides: instance.overrides.clone(),
        })
    }

    async fn list_stack_set_operations(&self, _name: &str) -> ServiceResult<Vec<OperationSummary>> {
        let mut state = self.state();
        state.calls.push(Call::ListOperations);

        let mut operations: Vec<OperationSummary> =
            state.operations.iter().rev().map(|op| op.summary.clone()).collect();
        if state.busy_listings > 0 {
            state.busy_listings -= 1;
            operations.insert(
                0,
                OperationSummary {
                    operation_id: "foreign-op".to_string(),
                    kind: Some(OperationKind::DetectDrift),
                    status: OperationStatus::Running,
                    status_reason: None,
                    created_at: None,
                },
            );
        }
        Ok(operations)
    }

    async fn describe_stack_set_operation(
        &self,
        _name: &str,
        operation_id: &str,
    ) -> ServiceResult<OperationSummary> {
        let mut state = self.state();
        state.calls.push(Call::DescribeOperation(operation_id.to_string()));
        if let Some(error) = state.describe_errors.pop_front() {
            return Err(error);
        }

        let index = state
            .operations
            .iter()
            .position(|op| op.summary.operation_id == operation_id)
            .ok_or_else(|| {
                ServiceError::new(ServiceErrorKind::OperationNotFound, operation_id)
            })?;

        if state.operations[index].summary.status.is_terminal() {
            return Ok(state.operations[index].summary.clone());
        }

        let outcome = match &mut state.operations[index].behavior {
            Behavior::Succeed { running_polls } if *running_polls > 0 => {
                *running_polls -= 1;
                None
            }
            Behavior::Succeed { .. } => Some((OperationStatus::Succeeded, None)),
            Behavior::Fail { reason } => Some((OperationStatus::Failed, Some(reason.clone()))),
            Behavior::Stop { reason } => Some((OperationStatus::Stopped, Some(reason.clone()))),
            Behavior::Hang => None,
        };

        if let Some((status, reason)) = outcome {
            let effect = state.operations[index].effect.clone();
            apply(&mut state, &effect, status != OperationStatus::Succeeded);
            let summary = &mut state.operations[index].summary;
            summary.status = status;
            summary.status_reason = reason;
        }
        Ok(state.operations[index].summary.clone())
    }
}

/// Policy with short, countable delays
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_conflict_backoff(stackset_orchestrator::Backoff::fixed(Duration::from_secs(30)))
        .with_max_conflict_attempts(5)
        .with_max_transient_attempts(3)
}

pub struct Harness {
    pub service: Arc<FakeService>,
    pub clock: Arc<ManualClock>,
    pub reporter: Arc<MemoryReporter>,
    pub reconciler: Reconciler,
}

pub fn harness(service: FakeService, config: ReconcilerConfig) -> Harness {
    let service = Arc::new(service);
    let clock = Arc::new(ManualClock::at_epoch());
    let reporter = Arc::new(MemoryReporter::new());
    let reconciler = Reconciler::new(
        service.clone(),
        clock.clone() as Arc<dyn Clock>,
        reporter.clone(),
        config,
    );
    Harness {
        service,
        clock,
        reporter,
        reconciler,
    }
}

pub fn default_config() -> ReconcilerConfig {
    ReconcilerConfig::new(STACK_SET)
        .with_retry(fast_policy())
        .with_poll_interval(Duration::from_secs(20))
        .with_poll_timeout(Duration::from_secs(120))
}

pub fn desired(json: &str) -> DeploymentConfig {
    DeploymentConfig::from_json(json).unwrap()
}

pub fn params(pairs: &[(&str, &str)]) -> ParameterSet {
    ParameterSet::from_pairs(pairs.iter().copied())
}

pub fn id(account: &str, region: &str) -> TargetId {
    TargetId::new(account, region)
}

/// Three accounts in us-east-1 with an AccountName override each
pub const THREE_ACCOUNTS: &str = r#"{
    "accounts": [
        {"accountId": "111111111111", "regions": ["us-east-1"],
         "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Dev"}]},
        {"accountId": "222222222222", "regions": ["us-east-1"],
         "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Test"}]},
        {"accountId": "333333333333", "regions": ["us-east-1"],
         "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Prod"}]}
    ]
}"#;
