//! DlqStore port - dead-letter の保管場所

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BobbinError, DlqItem, DlqItemId, DlqStatus, ReplayRun, TenantId};

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<DlqStatus>,
    pub limit: Option<usize>,
}

impl DlqFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &DlqItem) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| &item.tenant_id == t)
            && self.status.is_none_or(|s| item.status == s)
    }
}

#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn insert(&self, item: DlqItem) -> Result<(), BobbinError>;

    /// Tenant-scoped lookup; an item of another tenant reads as absent.
    async fn get(&self, tenant_id: &TenantId, id: DlqItemId)
    -> Result<Option<DlqItem>, BobbinError>;

    /// Oldest first.
    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, BobbinError>;

    /// Conditional status update within a tenant.
    async fn set_status(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
        status: DlqStatus,
        reviewed_by: Option<String>,
    ) -> Result<DlqItem, BobbinError>;

    /// Remove and return an item (ownership goes back to the task store).
    async fn take(&self, tenant_id: &TenantId, id: DlqItemId)
    -> Result<Option<DlqItem>, BobbinError>;

    /// Remove by id regardless of tenant; used to undo a failed hand-off.
    async fn remove(&self, id: DlqItemId) -> Result<(), BobbinError>;

    async fn count(&self, tenant_id: Option<&TenantId>) -> Result<usize, BobbinError>;

    async fn record_replay(&self, run: ReplayRun) -> Result<(), BobbinError>;

    /// Replay runs at or after `since`, oldest first.
    async fn replay_runs(
        &self,
        tenant_id: Option<&TenantId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReplayRun>, BobbinError>;
}
