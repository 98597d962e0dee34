//! Desired-state configuration and reconciler settings
//!
//! The desired state is a JSON file listing accounts, their regions and their
//! parameter overrides:
//!
//! ```json
//! {
//!   "commonParameters": [{"ParameterKey": "Env", "ParameterValue": "prod"}],
//!   "accounts": [
//!     {
//!       "accountId": "111111111111",
//!       "regions": ["us-east-1", "eu-west-1"],
//!       "parameters": [{"ParameterKey": "AccountName", "ParameterValue": "Dev"}]
//!     }
//!   ]
//! }
//! ```
//!
//! Every (account, region) pair becomes its own [`Target`]. The same account
//! may appear in several entries as long as no pair repeats.

use crate::error::{ReconcileError, Result};
use crate::parameters::{Parameter, ParameterSet};
use crate::poller::{DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_TIMEOUT_SECS};
use crate::retry::RetryPolicy;
use crate::target::{Target, TargetId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default configuration file name
pub const DEFAULT_CONFIG_PATH: &str = "account-parameters.json";

/// Default stack-set name
pub const DEFAULT_STACK_SET_NAME: &str = "StackSet-Name";

/// One account entry as written in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEntry {
    /// 12-digit account ID
    pub account_id: String,

    /// Regions to deploy to, in order
    pub regions: Vec<String>,

    /// Per-account parameter overrides
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl AccountEntry {
    /// Display name taken from the `AccountName` parameter, if present
    pub fn account_name(&self) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == "AccountName")
            .map(|p| p.value.as_str())
    }
}

/// Raw configuration file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDeploymentConfig {
    /// Stack-set name; the CLI flag takes precedence
    #[serde(default)]
    pub stack_set_name: Option<String>,

    /// Parameters shared by every account
    #[serde(default)]
    pub common_parameters: Vec<Parameter>,

    /// Account entries
    pub accounts: Vec<AccountEntry>,
}

/// Validated desired state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// Stack-set name from the file, if given
    pub stack_set_name: Option<String>,

    /// Parameters shared by every target
    pub common_parameters: ParameterSet,

    /// Targets in file order
    pub targets: Vec<Target>,

    /// Raw entries, kept for display names
    pub accounts: Vec<AccountEntry>,
}

impl DeploymentConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&content)?;
        debug!(
            path = %path.display(),
            targets = config.targets.len(),
            "Loaded deployment configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawDeploymentConfig = serde_json::from_str(json)
            .map_err(|e| ReconcileError::config(format!("malformed configuration: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Validate a parsed configuration
    pub fn from_raw(raw: RawDeploymentConfig) -> Result<Self> {
        let common_parameters = ParameterSet::try_from_parameters(raw.common_parameters)
            .map_err(|key| {
                ReconcileError::config(format!("duplicate common parameter '{}'", key))
            })?;

        let mut seen: HashSet<TargetId> = HashSet::new();
        let mut targets = Vec::new();

        for (index, entry) in raw.accounts.iter().enumerate() {
            validate_account_id(&entry.account_id)
                .map_err(|msg| ReconcileError::config(format!("accounts[{}]: {}", index, msg)))?;

            if entry.regions.is_empty() {
                return Err(ReconcileError::config(format!(
                    "accounts[{}] ({}): no regions listed",
                    index, entry.account_id
                )));
            }

            let parameters = ParameterSet::try_from_parameters(entry.parameters.clone())
                .map_err(|key| {
                    ReconcileError::config(format!(
                        "accounts[{}] ({}): duplicate parameter '{}'",
                        index, entry.account_id, key
                    ))
                })?;

            for region in &entry.regions {
                if region.trim().is_empty() {
                    return Err(ReconcileError::config(format!(
                        "accounts[{}] ({}): empty region",
                        index, entry.account_id
                    )));
                }

                let id = TargetId::new(entry.account_id.clone(), region.clone());
                if !seen.insert(id.clone()) {
                    return Err(ReconcileError::config(format!(
                        "duplicate target {}",
                        id
                    )));
                }
                targets.push(Target::desired(id, parameters.clone()));
            }
        }

        Ok(Self {
            stack_set_name: raw.stack_set_name,
            common_parameters,
            targets,
            accounts: raw.accounts,
        })
    }

    /// Display name for an account, if the configuration gives one
    pub fn account_name(&self, account_id: &str) -> Option<&str> {
        self.accounts
            .iter()
            .find(|a| a.account_id == account_id)
            .and_then(AccountEntry::account_name)
    }

    /// Whether any target belongs to the account
    pub fn has_account(&self, account_id: &str) -> bool {
        self.targets.iter().any(|t| t.account() == account_id)
    }
}

fn validate_account_id(account_id: &str) -> std::result::Result<(), String> {
    if account_id.len() == 12 && account_id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(format!("invalid account ID '{}' (expected 12 digits)", account_id))
    }
}

/// Settings for a reconciliation run
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Stack-set to reconcile
    pub stack_set_name: String,

    /// Retry budget for initiating operations
    pub retry: RetryPolicy,

    /// Interval between operation status queries
    pub poll_interval: Duration,

    /// Local wait budget per operation
    pub poll_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stack_set_name: DEFAULT_STACK_SET_NAME.to_string(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
        }
    }
}

impl ReconcilerConfig {
    /// Create config for a stack-set
    pub fn new(stack_set_name: impl Into<String>) -> Self {
        Self {
            stack_set_name: stack_set_name.into(),
            ..Default::default()
        }
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}
