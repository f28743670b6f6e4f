//! Errors - エラー型と分類

use thiserror::Error;

use super::ids::{DlqItemId, TaskId, WorkerId};
use super::state::TaskStatus;

/// ErrorKind は運用上の分類
///
/// - Transient: 一時的（リトライで回復しうる）
/// - Permanent: 恒久的（リトライ無意味）
/// - Infrastructure: ストア等の障害
/// - Rejected: 呼び出し側の入力・前提条件の誤り
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
    Rejected,
}

#[derive(Debug, Error)]
pub enum BobbinError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("dlq item not found: {0}")]
    DlqItemNotFound(DlqItemId),

    #[error("lease lost: {task_id} is no longer held by {worker_id}")]
    LeaseLost { task_id: TaskId, worker_id: WorkerId },

    #[error("invalid transition for {task_id}: {from:?} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: &'static str,
    },

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("tenant_id is required")]
    TenantRequired,

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("event sink error: {0}")]
    EventSink(String),
}

impl BobbinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BobbinError::StoreUnavailable(_) | BobbinError::EventSink(_) => {
                ErrorKind::Infrastructure
            }
            BobbinError::UnknownCapability(_) => ErrorKind::Permanent,
            BobbinError::LeaseLost { .. } => ErrorKind::Transient,
            BobbinError::TaskNotFound(_)
            | BobbinError::DlqItemNotFound(_)
            | BobbinError::InvalidTransition { .. }
            | BobbinError::DuplicateTask(_)
            | BobbinError::TenantRequired
            | BobbinError::InvalidInput(_)
            | BobbinError::Config(_) => ErrorKind::Rejected,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, BobbinError::StoreUnavailable(_))
    }
}
