//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Queued -> Claimed -> Running -> Completed
/// - Claimed/Running -> Failed (retry scheduled) -> Claimed ... (until max_attempts)
/// - Claimed/Running -> DeadLettered (attempts exhausted, or permanent failure)
/// - Claimed/Running -> Queued (lease expired, swept)
/// - any non-terminal -> Cancelled (tenant drain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Queued,

    /// Leased by a worker, not started yet.
    Claimed,

    /// Handler is executing.
    Running,

    /// Finished successfully.
    Completed,

    /// Last attempt failed; eligible again once `next_attempt_at` passes.
    Failed,

    /// Handed off to the DLQ.
    DeadLettered,

    /// Removed by a tenant drain.
    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::DeadLettered | TaskStatus::Cancelled
        )
    }

    /// Waiting for a worker (subject to `next_attempt_at`).
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Failed)
    }

    /// Held under a lease.
    pub fn is_leased(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}
