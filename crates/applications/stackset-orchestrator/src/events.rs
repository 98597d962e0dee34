//! Structured progress events
//!
//! The reconciler emits one [`ProgressEvent`] per state change and never
//! waits on the reporter. [`TracingReporter`] renders events as log lines,
//! [`JsonLinesReporter`] prints one JSON object per line on stdout, and
//! [`MemoryReporter`] keeps them for inspection.

use crate::plan::ActionKind;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// A reconciliation progress event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum ProgressEvent {
    /// Work on a target began
    TargetStarted {
        /// Account ID
        account: String,
        /// Region
        region: String,
        /// Planned action
        action: ActionKind,
    },

    /// Initiation hit a conflict and will be retried
    ConflictRetry {
        /// Account ID
        account: String,
        /// Region
        region: String,
        /// Attempt that conflicted (1-based)
        attempt: u32,
        /// Delay before the next attempt (seconds)
        delay_secs: f64,
    },

    /// Initiation hit a transient error and will be retried
    TransientRetry {
        /// Account ID
        account: String,
        /// Region
        region: String,
        /// Attempt that failed (1-based)
        attempt: u32,
        /// Delay before the next attempt (seconds)
        delay_secs: f64,
        /// Error text
        reason: String,
    },

    /// Target reached conformance
    TargetSucceeded {
        /// Account ID
        account: String,
        /// Region
        region: String,
    },

    /// Target could not be brought into conformance
    TargetFailed {
        /// Account ID
        account: String,
        /// Region
        region: String,
        /// Failure reason
        reason: String,
    },

    /// Local wait ended before the operation finished; outcome unknown
    TargetTimedOut {
        /// Account ID
        account: String,
        /// Region
        region: String,
        /// Operation still running server-side
        operation_id: String,
    },

    /// Run finished
    RunCompleted {
        /// Targets that succeeded
        succeeded: usize,
        /// Targets that failed
        failed: usize,
        /// Targets already conformant
        skipped: usize,
        /// Targets whose outcome is unknown
        timed_out: usize,
        /// Targets not started because the run was cancelled
        cancelled: usize,
    },
}

/// Receiver of progress events
pub trait ProgressReporter: Send + Sync {
    /// Handle one event
    fn report(&self, event: &ProgressEvent);
}

/// Logs events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TargetStarted {
                account,
                region,
                action,
            } => info!("🚀 {} {}/{}", action, account, region),
            ProgressEvent::ConflictRetry {
                account,
                region,
                attempt,
                delay_secs,
            } => info!(
                "⏳ Another operation in progress for {}/{} (attempt {}), retrying in {:.0}s",
                account, region, attempt, delay_secs
            ),
            ProgressEvent::TransientRetry {
                account,
                region,
                attempt,
                delay_secs,
                reason,
            } => warn!(
                "⚠️  Transient error for {}/{} (attempt {}): {}, retrying in {:.0}s",
                account, region, attempt, reason, delay_secs
            ),
            ProgressEvent::TargetSucceeded { account, region } => {
                info!("✅ Successfully deployed to {}/{}", account, region)
            }
            ProgressEvent::TargetFailed {
                account,
                region,
                reason,
            } => error!("❌ {}/{} failed: {}", account, region, reason),
            ProgressEvent::TargetTimedOut {
                account,
                region,
                operation_id,
            } => warn!(
                "⌛ Stopped waiting on {}/{}; operation {} may still complete, re-run to observe it",
                account, region, operation_id
            ),
            ProgressEvent::RunCompleted {
                succeeded,
                failed,
                skipped,
                timed_out,
                cancelled,
            } => info!(
                "📊 Done: ✓ {} succeeded | ✗ {} failed | ⏭ {} skipped | ⌛ {} timed out | ⏹ {} cancelled",
                succeeded, failed, skipped, timed_out, cancelled
            ),
        }
    }
}

/// Prints each event as a JSON line on stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesReporter;

impl ProgressReporter for JsonLinesReporter {
    fn report(&self, event: &ProgressEvent) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize progress event"),
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemoryReporter {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProgressReporter for MemoryReporter {
    fn report(&self, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
