//! StateFile - 複数プロセスで共有する JSON 状態ファイル上のストア
//!
//! 操作ごとに隣の `.lock` ファイルを排他ロック（fs2）し、
//! 最新の状態を読み込み → MemoryBackend 上で 1 操作 → 変更があれば書き戻す。
//! 別プロセスの stop / pause / enqueue は、次の操作でそのまま見える。
//!
//! 状態ファイル本体は rename で置き換わるので、ロックは本体ではなく `.lock` に取る。

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::sync::{Mutex, MutexGuard};

use super::snapshot::{MemoryBackend, Snapshot};
use crate::domain::{
    BobbinError, DlqItem, DlqItemId, DlqStatus, FeatureFlag, FlagScope, FlagUpdate, ReplayRun,
    TaskId, TaskRecord, TenantId, Transition, WorkerId,
};
use crate::ports::{
    ClaimRequest, Clock, DlqFilter, DlqStore, FlagStore, TaskCounts, TaskFilter, TaskStore,
    TenantGate, WorkerHeartbeat,
};

pub struct StateFile {
    path: PathBuf,
    lock_path: PathBuf,
    clock: Arc<dyn Clock>,
    // 同一プロセス内の操作は先にここで直列化する
    local: Mutex<()>,
}

/// The loaded state while the file lock is held.
struct Locked<'a> {
    _local: MutexGuard<'a, ()>,
    lock: File,
    path: &'a Path,
    backend: MemoryBackend,
}

impl Locked<'_> {
    async fn commit(self) -> Result<(), BobbinError> {
        let snapshot = self.backend.snapshot().await;
        let path = self.path.to_path_buf();
        let lock = self.lock;
        tokio::task::spawn_blocking(move || {
            let saved = snapshot.save(&path);
            drop(lock);
            saved
        })
        .await
        .map_err(|e| BobbinError::StoreUnavailable(format!("state file writer: {e}")))?
    }
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            clock,
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents, read under the lock.
    pub async fn load(&self) -> Result<Snapshot, BobbinError> {
        let state = self.open().await?;
        Ok(state.backend.snapshot().await)
    }

    async fn open(&self) -> Result<Locked<'_>, BobbinError> {
        let local = self.local.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let (lock, snapshot) = tokio::task::spawn_blocking(move || {
            let lock = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| {
                    BobbinError::StoreUnavailable(format!("open {}: {e}", lock_path.display()))
                })?;
            lock.lock_exclusive().map_err(|e| {
                BobbinError::StoreUnavailable(format!("lock {}: {e}", lock_path.display()))
            })?;
            let snapshot = Snapshot::load(&path)?;
            Ok::<_, BobbinError>((lock, snapshot))
        })
        .await
        .map_err(|e| BobbinError::StoreUnavailable(format!("state file reader: {e}")))??;

        Ok(Locked {
            _local: local,
            lock,
            path: &self.path,
            backend: MemoryBackend::restore(self.clock.clone(), snapshot),
        })
    }
}

#[async_trait]
impl TaskStore for StateFile {
    async fn insert(&self, task: TaskRecord) -> Result<(), BobbinError> {
        let state = self.open().await?;
        state.backend.tasks.insert(task).await?;
        state.commit().await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, BobbinError> {
        let state = self.open().await?;
        state.backend.tasks.get(id).await
    }

    async fn claim_next(
        &self,
        request: ClaimRequest<'_>,
        gate: TenantGate<'_>,
    ) -> Result<Option<TaskRecord>, BobbinError> {
        let state = self.open().await?;
        let claimed = state.backend.tasks.claim_next(request, gate).await?;
        if claimed.is_some() {
            state.commit().await?;
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: TaskId,
        worker: &WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, BobbinError> {
        let state = self.open().await?;
        let task = state
            .backend
            .tasks
            .transition(id, worker, transition, now)
            .await?;
        state.commit().await?;
        Ok(task)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, BobbinError> {
        let state = self.open().await?;
        let reclaimed = state.backend.tasks.reclaim_expired(now).await?;
        if !reclaimed.is_empty() {
            state.commit().await?;
        }
        Ok(reclaimed)
    }

    async fn cancel_tenant(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, BobbinError> {
        let state = self.open().await?;
        let cancelled = state.backend.tasks.cancel_tenant(tenant_id, now).await?;
        if !cancelled.is_empty() {
            state.commit().await?;
        }
        Ok(cancelled)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, BobbinError> {
        let state = self.open().await?;
        state.backend.tasks.list(filter).await
    }

    async fn counts(&self, tenant_id: Option<&TenantId>) -> Result<TaskCounts, BobbinError> {
        let state = self.open().await?;
        state.backend.tasks.counts(tenant_id).await
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        let state = self.open().await?;
        state.backend.tasks.heartbeat(worker, now, expires_at).await?;
        state.commit().await
    }

    async fn live_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>, BobbinError> {
        let state = self.open().await?;
        state.backend.tasks.live_workers(now).await
    }
}

#[async_trait]
impl DlqStore for StateFile {
    async fn insert(&self, item: DlqItem) -> Result<(), BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.insert(item).await?;
        state.commit().await
    }

    async fn get(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
    ) -> Result<Option<DlqItem>, BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.get(tenant_id, id).await
    }

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.list(filter).await
    }

    async fn set_status(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
        status: DlqStatus,
        reviewed_by: Option<String>,
    ) -> Result<DlqItem, BobbinError> {
        let state = self.open().await?;
        let item = state
            .backend
            .dlq
            .set_status(tenant_id, id, status, reviewed_by)
            .await?;
        state.commit().await?;
        Ok(item)
    }

    async fn take(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
    ) -> Result<Option<DlqItem>, BobbinError> {
        let state = self.open().await?;
        let taken = state.backend.dlq.take(tenant_id, id).await?;
        if taken.is_some() {
            state.commit().await?;
        }
        Ok(taken)
    }

    async fn remove(&self, id: DlqItemId) -> Result<(), BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.remove(id).await?;
        state.commit().await
    }

    async fn count(&self, tenant_id: Option<&TenantId>) -> Result<usize, BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.count(tenant_id).await
    }

    async fn record_replay(&self, run: ReplayRun) -> Result<(), BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.record_replay(run).await?;
        state.commit().await
    }

    async fn replay_runs(
        &self,
        tenant_id: Option<&TenantId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReplayRun>, BobbinError> {
        let state = self.open().await?;
        state.backend.dlq.replay_runs(tenant_id, since).await
    }
}

#[async_trait]
impl FlagStore for StateFile {
    async fn get(
        &self,
        key: &str,
        scope: &FlagScope,
        environment: &str,
    ) -> Result<Option<FeatureFlag>, BobbinError> {
        let state = self.open().await?;
        state.backend.flags.get(key, scope, environment).await
    }

    async fn upsert(&self, update: FlagUpdate) -> Result<FeatureFlag, BobbinError> {
        let state = self.open().await?;
        let flag = state.backend.flags.upsert(update).await?;
        state.commit().await?;
        Ok(flag)
    }

    async fn list_key(
        &self,
        key: &str,
        environment: &str,
    ) -> Result<Vec<FeatureFlag>, BobbinError> {
        let state = self.open().await?;
        state.backend.flags.list_key(key, environment).await
    }

    async fn list(&self, environment: &str) -> Result<Vec<FeatureFlag>, BobbinError> {
        let state = self.open().await?;
        state.backend.flags.list(environment).await
    }
}
