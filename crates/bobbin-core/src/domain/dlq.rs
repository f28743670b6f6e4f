//! Dead-letter items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::Capability;
use super::ids::{DlqItemId, TaskId, TraceId};
use super::task::{NewTask, TaskRecord};
use super::tenant::TenantId;

/// DLQ item status.
///
/// - Pending: written, but the source task has not reached dead_lettered yet
/// - Failed: dead-lettered, replay candidate
/// - Quarantined: held for manual review, never picked by replay
/// - Ready: reviewed and released, replay candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Failed,
    Quarantined,
    Ready,
}

impl DlqStatus {
    pub fn is_replayable(self) -> bool {
        matches!(self, DlqStatus::Failed | DlqStatus::Ready)
    }
}

impl std::str::FromStr for DlqStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DlqStatus::Pending),
            "failed" => Ok(DlqStatus::Failed),
            "quarantined" => Ok(DlqStatus::Quarantined),
            "ready" => Ok(DlqStatus::Ready),
            other => Err(format!("unknown dlq status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: DlqItemId,
    pub tenant_id: TenantId,
    pub source_task_id: TaskId,
    pub capability: Capability,
    pub payload: serde_json::Value,
    /// Serialized payload size, for replay budgets.
    pub payload_bytes: u64,
    pub attempts: u32,
    pub last_error: String,
    pub status: DlqStatus,
    pub trace_id: Option<TraceId>,
    pub reviewed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_error_at: DateTime<Utc>,
}

impl DlqItem {
    /// Build an item from a task that is being dead-lettered.
    ///
    /// `attempts` is passed in because permanent failures do not consume one.
    pub fn from_task(
        id: DlqItemId,
        task: &TaskRecord,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id: task.tenant_id.clone(),
            source_task_id: task.id,
            capability: task.capability.clone(),
            payload: task.payload.clone(),
            payload_bytes: payload_size(&task.payload),
            attempts,
            last_error: error.to_string(),
            status: DlqStatus::Failed,
            trace_id: task.trace_id.clone(),
            reviewed_by: None,
            created_at: now,
            last_error_at: now,
        }
    }

    /// The fresh task a replay re-enqueues (attempts start over at 0).
    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            tenant_id: self.tenant_id.clone(),
            capability: self.capability.clone(),
            payload: self.payload.clone(),
            trace_id: self.trace_id.clone(),
            not_before: None,
        }
    }
}

/// One executed replay batch, kept for the daily budget and fail rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRun {
    pub tenant_id: TenantId,
    pub actor: String,
    pub at: DateTime<Utc>,
    /// Tasks created by this replay.
    pub task_ids: Vec<TaskId>,
}

pub fn payload_size(payload: &serde_json::Value) -> u64 {
    serde_json::to_vec(payload)
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(0)
}
