//! TaskStore port - タスクの正本（source of truth）
//!
//! # 設計原則
//! - 書き込みはすべて task id 単位の条件付き単一行更新
//! - `claim_next` は「次の適格な行を取る」1 回の原子的操作（read-then-write にしない）
//! - Lease の権威はここにある
//! - ワーカーの生存確認（heartbeat）もここに記録する
//!
//! 実装は `StoreUnavailable` を返すことで「ストア到達不能」を表現する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BobbinError, TaskId, TaskRecord, TaskStatus, TenantId, Transition, WorkerId};

/// Tenant gate evaluated inside the atomic claim.
pub type TenantGate<'a> = &'a (dyn Fn(&TenantId) -> bool + Send + Sync);

#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub worker_id: &'a WorkerId,
    pub now: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &TaskRecord) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| &task.tenant_id == t)
            && self.status.is_none_or(|s| task.status == s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::DeadLettered => self.dead_lettered += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Tasks waiting for a worker (queued or awaiting retry).
    pub fn backlog(&self) -> usize {
        self.queued + self.failed
    }

    pub fn in_flight(&self) -> usize {
        self.claimed + self.running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub last_seen: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new queued task.
    async fn insert(&self, task: TaskRecord) -> Result<(), BobbinError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, BobbinError>;

    /// Atomically claim the next eligible task whose tenant passes `gate`.
    ///
    /// Eligible: waiting and `next_attempt_at <= now`; earliest
    /// `next_attempt_at` first, then `created_at`. `Ok(None)` when nothing is
    /// eligible.
    async fn claim_next(
        &self,
        request: ClaimRequest<'_>,
        gate: TenantGate<'_>,
    ) -> Result<Option<TaskRecord>, BobbinError>;

    /// Apply a transition if `worker` still holds the lease.
    async fn transition(
        &self,
        id: TaskId,
        worker: &WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, BobbinError>;

    /// Return tasks with an expired lease to queued. Returns their ids.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, BobbinError>;

    /// Cancel every non-terminal task of a tenant. Returns their ids.
    async fn cancel_tenant(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, BobbinError>;

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, BobbinError>;

    async fn counts(&self, tenant_id: Option<&TenantId>) -> Result<TaskCounts, BobbinError>;

    /// Record that `worker` is alive until `expires_at`.
    async fn heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BobbinError>;

    /// Workers whose heartbeat has not expired.
    async fn live_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>, BobbinError>;
}
