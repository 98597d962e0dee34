//! Reconciliation planning
//!
//! Compares desired targets with observed stack instances and decides, per
//! target, whether to create, update, refresh parameters, or skip:
//!
//! | Observed        | CreateOnly | Update                          | ParametersOnly              |
//! |-----------------|------------|---------------------------------|-----------------------------|
//! | absent          | CREATE     | CREATE                          | CREATE                      |
//! | failing         | UPDATE     | UPDATE                          | UPDATE                      |
//! | deployed/drifted| skip       | UPDATE if template, status or   | UPDATE_PARAMETERS_ONLY if   |
//! |                 |            | merged parameters differ        | merged parameters differ    |
//!
//! The plan keeps configuration order, so re-running after a partial failure
//! resumes at the first target that is still not conformant. Planning is pure:
//! running it again over the state it produced yields an empty plan.

use crate::parameters::{merge, ParameterSet};
use crate::target::{ObservedStatus, Target, TargetId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

/// How far the reconciler may go with existing instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlanMode {
    /// Only create missing instances (and re-push failing ones)
    #[default]
    CreateOnly,
    /// Also update drifted instances, including template changes
    Update,
    /// Also re-push merged parameters, never touching the template
    ParametersOnly,
}

/// Action planned for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Create the stack instance
    Create,
    /// Bring the instance up to the desired template and parameters
    Update,
    /// Re-push merged parameters only
    UpdateParametersOnly,
    /// Remove the stack instance
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::UpdateParametersOnly => "UPDATE_PARAMETERS_ONLY",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Inputs to [`compute_plan`] besides the two target lists
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Planning mode
    pub mode: PlanMode,

    /// Restrict the plan to one account
    pub account_filter: Option<String>,

    /// Stack-set level values, used as defaults under the other layers
    pub template_defaults: ParameterSet,

    /// Parameter keys the applied template declares; `None` when unknown
    pub declared_keys: Option<BTreeSet<String>>,

    /// Values shared by every target
    pub common_parameters: ParameterSet,

    /// New template body, when it differs from the one applied
    pub changed_template: Option<String>,
}

impl PlanOptions {
    /// Create options for a mode
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

    /// Set stack-set level defaults
    pub fn with_template_defaults(mut self, defaults: ParameterSet) -> Self {
        self.template_defaults = defaults;
        self
    }

    /// Set the template's declared parameter keys
    pub fn with_declared_keys(mut self, declared: BTreeSet<String>) -> Self {
        self.declared_keys = Some(declared);
        self
    }

    /// Set common parameters
    pub fn with_common_parameters(mut self, common: ParameterSet) -> Self {
        self.common_parameters = common;
        self
    }

    /// Mark the template as changed
    pub fn with_changed_template(mut self, template_body: impl Into<String>) -> Self {
        self.changed_template = Some(template_body.into());
        self
    }
}

/// One planned per-target action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    /// Target
    pub target: TargetId,

    /// What to do
    pub kind: ActionKind,

    /// Overrides to push: common values merged under the target's own
    pub overrides: ParameterSet,

    /// Template to roll out first (UPDATE only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_body: Option<String>,

    /// Stack-set level values sent with a template roll-out
    pub stack_set_parameters: ParameterSet,

    /// Merged keys whose value differs from the instance's record
    pub changed_keys: Vec<String>,
}

impl PlannedAction {
    /// Whether the instance overrides need pushing
    pub fn pushes_overrides(&self) -> bool {
        match self.kind {
            ActionKind::Create | ActionKind::UpdateParametersOnly => true,
            ActionKind::Update => self.template_body.is_none() || !self.changed_keys.is_empty(),
            ActionKind::Delete => false,
        }
    }
}

/// Ordered actions for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    /// Actions in configuration order
    pub actions: Vec<PlannedAction>,

    /// Conformant targets left alone
    pub skipped: Vec<TargetId>,

    /// Parameter keys the applied template declares; `None` when unknown
    pub declared_keys: Option<BTreeSet<String>>,
}

impl ReconciliationPlan {
    /// Whether nothing needs doing
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of planned actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Number of actions of one kind
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

/// Diff desired targets against observed instances
pub fn compute_plan(
    desired: &[Target],
    observed: &[Target],
    options: &PlanOptions,
) -> ReconciliationPlan {
    let observed_by_id: HashMap<&TargetId, &Target> =
        observed.iter().map(|t| (&t.id, t)).collect();
    let empty = ParameterSet::new();
    let defaults = &options.template_defaults;
    let stack_set_parameters = merge(defaults, &options.common_parameters, &empty);

    let mut plan = ReconciliationPlan {
        declared_keys: options.declared_keys.clone(),
        ..Default::default()
    };

    for target in desired {
        if let Some(account) = &options.account_filter {
            if target.account() != account {
                continue;
            }
        }

        let overrides = merge(&empty, &options.common_parameters, &target.parameters);
        let wanted = merge(defaults, &options.common_parameters, &target.parameters);

        let (kind, changed_keys) = match observed_by_id.get(&target.id) {
            None => (Some(ActionKind::Create), Vec::new()),
            Some(instance) => {
                let on_record = merge(defaults, &empty, &instance.parameters);
                let changed_keys = wanted.changed_keys(&on_record);
                (decide(options, instance.status, &changed_keys), changed_keys)
            }
        };

        match kind {
            Some(kind) => {
                debug!(instance = %target.id, action = %kind, changed = ?changed_keys, "Planned action");
                let template_body = match kind {
                    ActionKind::Update => options.changed_template.clone(),
                    _ => None,
                };
                plan.actions.push(PlannedAction {
                    target: target.id.clone(),
                    kind,
                    overrides,
                    template_body,
                    stack_set_parameters: stack_set_parameters.clone(),
                    changed_keys,
                });
            }
            None => {
                debug!(instance = %target.id, "Conformant, skipping");
                plan.skipped.push(target.id.clone());
            }
        }
    }

    plan
}

fn decide(
    options: &PlanOptions,
    status: ObservedStatus,
    changed_keys: &[String],
) -> Option<ActionKind> {
    let parameters_differ = !changed_keys.is_empty();
    match (status, options.mode) {
        (ObservedStatus::Absent, _) => Some(ActionKind::Create),
        (ObservedStatus::Failing, _) => Some(ActionKind::Update),
        (ObservedStatus::Deployed | ObservedStatus::Drifted, PlanMode::CreateOnly) => None,
        (ObservedStatus::Deployed | ObservedStatus::Drifted, PlanMode::Update) => {
            let outdated = status == ObservedStatus::Drifted;
            (options.changed_template.is_some() || outdated || parameters_differ)
                .then_some(ActionKind::Update)
        }
        (ObservedStatus::Deployed | ObservedStatus::Drifted, PlanMode::ParametersOnly) => {
            parameters_differ.then_some(ActionKind::UpdateParametersOnly)
        }
    }
}
