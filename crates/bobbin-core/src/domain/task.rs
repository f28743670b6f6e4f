//! Task record: the single source of truth for one unit of work.
//!
//! 状態遷移はすべてこのファイルのメソッドで行う。ストア実装は
//! ロックの内側でこれらを呼ぶだけにする（条件付き単一行更新）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::Capability;
use super::errors::BobbinError;
use super::ids::{TaskId, TraceId, WorkerId};
use super::state::TaskStatus;
use super::tenant::TenantId;

/// Producer-side description of a task to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub tenant_id: TenantId,
    pub capability: Capability,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    /// Delay the first attempt until this time.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(
        tenant_id: TenantId,
        capability: impl Into<Capability>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            capability: capability.into(),
            payload,
            trace_id: None,
            not_before: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// A transition reported by the lease holder.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Claimed -> Running.
    Start,
    /// Success.
    Complete { result: Option<serde_json::Value> },
    /// Failure with attempts left: count the attempt, wait for backoff.
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Failure that ends in the DLQ. Permanent failures do not consume an attempt.
    DeadLetter { error: String, consume_attempt: bool },
}

impl Transition {
    fn target(&self) -> &'static str {
        match self {
            Transition::Start => "running",
            Transition::Complete { .. } => "completed",
            Transition::Retry { .. } => "failed",
            Transition::DeadLetter { .. } => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub capability: Capability,
    pub payload: serde_json::Value,
    pub status: TaskStatus,

    /// Number of failed attempts so far. Only increases.
    pub attempts: u32,

    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub trace_id: Option<TraceId>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: task.tenant_id,
            capability: task.capability,
            payload: task.payload,
            status: TaskStatus::Queued,
            attempts: 0,
            next_attempt_at: task.not_before.unwrap_or(now),
            claimed_by: None,
            lease_expires_at: None,
            trace_id: task.trace_id,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Waiting and due.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.next_attempt_at <= now
    }

    /// Leased and the lease has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Does `worker` currently own this task?
    ///
    /// An expired lease still counts until the sweep reclaims it: nobody else
    /// can hold the task in the meantime.
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status.is_leased() && self.claimed_by.as_ref() == Some(worker)
    }

    /// Waiting -> Claimed.
    pub fn claim(
        &mut self,
        worker: WorkerId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        if !self.is_claimable(now) {
            return Err(BobbinError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: "claimed",
            });
        }
        self.status = TaskStatus::Claimed;
        self.claimed_by = Some(worker);
        self.lease_expires_at = Some(lease_expires_at);
        self.updated_at = now;
        Ok(())
    }

    /// Apply a transition on behalf of the lease holder.
    pub fn apply(
        &mut self,
        worker: &WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        if !self.is_held_by(worker) {
            return Err(BobbinError::LeaseLost {
                task_id: self.id,
                worker_id: worker.clone(),
            });
        }

        match transition {
            Transition::Start => {
                if self.status != TaskStatus::Claimed {
                    return Err(BobbinError::InvalidTransition {
                        task_id: self.id,
                        from: self.status,
                        to: Transition::Start.target(),
                    });
                }
                self.status = TaskStatus::Running;
            }
            Transition::Complete { result } => {
                self.status = TaskStatus::Completed;
                self.result = result;
                self.release_lease();
            }
            Transition::Retry {
                error,
                next_attempt_at,
            } => {
                self.attempts += 1;
                self.status = TaskStatus::Failed;
                self.next_attempt_at = next_attempt_at;
                self.last_error = Some(error);
                self.release_lease();
            }
            Transition::DeadLetter {
                error,
                consume_attempt,
            } => {
                if consume_attempt {
                    self.attempts += 1;
                }
                self.status = TaskStatus::DeadLettered;
                self.last_error = Some(error);
                self.release_lease();
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Leased with an expired lease -> Queued. Attempts are untouched.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> bool {
        if !self.lease_expired(now) {
            return false;
        }
        self.status = TaskStatus::Queued;
        self.release_lease();
        self.updated_at = now;
        true
    }

    /// Any non-terminal -> Cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.release_lease();
        self.updated_at = now;
        true
    }

    fn release_lease(&mut self) {
        self.claimed_by = None;
        self.lease_expires_at = None;
    }
}
