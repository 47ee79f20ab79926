//! Run execution: scheduler, per-node supervisor, and the run controller

pub mod controller;
pub mod scheduler;
pub mod supervisor;

use serde::{Deserialize, Serialize};

pub use controller::{NodeReport, Run, RunReport, RunStatus};
pub use scheduler::{Outcome, Scheduler, Skip, Transition};

/// Lifecycle status of one node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting on at least one predecessor
    Pending,
    /// All predecessors succeeded, queued for dispatch
    Ready,
    /// An attempt is in flight
    Running,
    /// Between a failed attempt and the next one
    Retrying,
    /// Terminal: all declared outputs written
    Succeeded,
    /// Terminal: attempts exhausted or non-retryable failure
    Failed,
    /// Terminal: never dispatched, a failed/skipped ancestor or cancellation
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}
