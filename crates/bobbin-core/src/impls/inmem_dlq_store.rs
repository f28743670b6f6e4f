//! InMemoryDlqStore - 開発・テスト用の DlqStore

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{BobbinError, DlqItem, DlqItemId, DlqStatus, ReplayRun, TenantId};
use crate::ports::{DlqFilter, DlqStore};

pub struct InMemoryDlqStore {
    items: Mutex<HashMap<DlqItemId, DlqItem>>,
    replays: Mutex<Vec<ReplayRun>>,
    available: AtomicBool,
}

impl InMemoryDlqStore {
    pub fn new() -> Self {
        Self::from_parts(Vec::new(), Vec::new())
    }

    pub fn from_parts(items: Vec<DlqItem>, replays: Vec<ReplayRun>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().map(|i| (i.id, i)).collect()),
            replays: Mutex::new(replays),
            available: AtomicBool::new(true),
        }
    }

    /// Every item oldest first, and the replay log.
    pub async fn export(&self) -> (Vec<DlqItem>, Vec<ReplayRun>) {
        let items = self.items.lock().await;
        let mut all: Vec<_> = items.values().cloned().collect();
        all.sort_by_key(|i| (i.created_at, i.id));
        (all, self.replays.lock().await.clone())
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), BobbinError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BobbinError::StoreUnavailable("dlq store offline".into()))
        }
    }
}

impl Default for InMemoryDlqStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn insert(&self, item: DlqItem) -> Result<(), BobbinError> {
        self.ensure_available()?;
        let mut items = self.items.lock().await;
        if items.contains_key(&item.id) {
            return Err(BobbinError::InvalidInput(format!(
                "dlq item already exists: {}",
                item.id
            )));
        }
        items.insert(item.id, item);
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
    ) -> Result<Option<DlqItem>, BobbinError> {
        self.ensure_available()?;
        let items = self.items.lock().await;
        Ok(items
            .get(&id)
            .filter(|i| &i.tenant_id == tenant_id)
            .cloned())
    }

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, BobbinError> {
        self.ensure_available()?;
        let items = self.items.lock().await;
        let mut result: Vec<_> = items
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        result.sort_by_key(|i| (i.created_at, i.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn set_status(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
        status: DlqStatus,
        reviewed_by: Option<String>,
    ) -> Result<DlqItem, BobbinError> {
        self.ensure_available()?;
        let mut items = self.items.lock().await;
        let item = items
            .get_mut(&id)
            .filter(|i| &i.tenant_id == tenant_id)
            .ok_or(BobbinError::DlqItemNotFound(id))?;
        item.status = status;
        if reviewed_by.is_some() {
            item.reviewed_by = reviewed_by;
        }
        Ok(item.clone())
    }

    async fn take(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
    ) -> Result<Option<DlqItem>, BobbinError> {
        self.ensure_available()?;
        let mut items = self.items.lock().await;
        if items.get(&id).is_some_and(|i| &i.tenant_id == tenant_id) {
            Ok(items.remove(&id))
        } else {
            Ok(None)
        }
    }

    async fn remove(&self, id: DlqItemId) -> Result<(), BobbinError> {
        self.ensure_available()?;
        self.items.lock().await.remove(&id);
        Ok(())
    }

    async fn count(&self, tenant_id: Option<&TenantId>) -> Result<usize, BobbinError> {
        self.ensure_available()?;
        let items = self.items.lock().await;
        Ok(items
            .values()
            .filter(|i| tenant_id.is_none_or(|t| &i.tenant_id == t))
            .count())
    }

    async fn record_replay(&self, run: ReplayRun) -> Result<(), BobbinError> {
        self.ensure_available()?;
        self.replays.lock().await.push(run);
        Ok(())
    }

    async fn replay_runs(
        &self,
        tenant_id: Option<&TenantId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReplayRun>, BobbinError> {
        self.ensure_available()?;
        let replays = self.replays.lock().await;
        let mut runs: Vec<_> = replays
            .iter()
            .filter(|r| r.at >= since && tenant_id.is_none_or(|t| &r.tenant_id == t))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.at);
        Ok(runs)
    }
}
