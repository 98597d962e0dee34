//! Deployment targets
//!
//! A target is one (account, region) pair of a stack-set. The same type holds
//! the desired side (parameters from the configuration, status `Absent`) and
//! the observed side (last-applied overrides and the reported status).

use crate::parameters::ParameterSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a stack instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    /// 12-digit AWS account ID
    pub account: String,
    /// AWS region
    pub region: String,
}

impl TargetId {
    /// Create a target identity
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// Observed state of a stack instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedStatus {
    /// No instance exists
    Absent,
    /// Instance is current with the stack-set
    Deployed,
    /// Instance lags the stack-set template
    Drifted,
    /// Last operation on the instance failed or it is inoperable
    Failing,
}

impl ObservedStatus {
    /// Whether an instance exists for the target
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Absent => "absent",
            Self::Deployed => "deployed",
            Self::Drifted => "drifted",
            Self::Failing => "failing",
        };
        f.write_str(name)
    }
}

/// A stack instance, desired or observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    /// Identity
    pub id: TargetId,

    /// Per-target parameter overrides (desired, or last applied when observed)
    pub parameters: ParameterSet,

    /// Observed status; `Absent` on the desired side
    pub status: ObservedStatus,

    /// Status reason reported by the service
    pub status_reason: Option<String>,
}

impl Target {
    /// Create a desired target
    pub fn desired(id: TargetId, parameters: ParameterSet) -> Self {
        Self {
            id,
            parameters,
            status: ObservedStatus::Absent,
            status_reason: None,
        }
    }

    /// Create an observed target
    pub fn observed(id: TargetId, parameters: ParameterSet, status: ObservedStatus) -> Self {
        Self {
            id,
            parameters,
            status,
            status_reason: None,
        }
    }

    /// Attach a status reason
    pub fn with_status_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    /// Account ID
    pub fn account(&self) -> &str {
        &self.id.account
    }

    /// Region
    pub fn region(&self) -> &str {
        &self.id.region
    }
}
