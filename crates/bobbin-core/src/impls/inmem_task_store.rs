//! InMemoryTaskStore - 開発・テスト用の TaskStore
//!
//! - 1 つの Mutex の内側で条件判定と更新を行うので、各操作は原子的
//! - `set_available(false)` でストア障害を再現できる

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{BobbinError, TaskId, TaskRecord, TenantId, Transition, WorkerId};
use crate::ports::{ClaimRequest, TaskCounts, TaskFilter, TaskStore, TenantGate, WorkerHeartbeat};

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, TaskRecord>,
    workers: HashMap<WorkerId, WorkerHeartbeat>,
}

pub struct InMemoryTaskStore {
    state: Arc<Mutex<TaskTable>>,
    available: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TaskTable::default())),
            available: AtomicBool::new(true),
        }
    }

    /// Rebuild from persisted rows.
    pub fn from_parts(tasks: Vec<TaskRecord>, workers: Vec<WorkerHeartbeat>) -> Self {
        let table = TaskTable {
            tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
            workers: workers
                .into_iter()
                .map(|w| (w.worker_id.clone(), w))
                .collect(),
        };
        Self {
            state: Arc::new(Mutex::new(table)),
            available: AtomicBool::new(true),
        }
    }

    /// Dump every row (tasks sorted by creation).
    pub async fn export(&self) -> (Vec<TaskRecord>, Vec<WorkerHeartbeat>) {
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        let mut workers: Vec<_> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        (tasks, workers)
    }

    /// Simulate an outage: every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), BobbinError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BobbinError::StoreUnavailable("task store offline".into()))
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: TaskRecord) -> Result<(), BobbinError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(BobbinError::DuplicateTask(task.id));
        }
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, BobbinError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        request: ClaimRequest<'_>,
        gate: TenantGate<'_>,
    ) -> Result<Option<TaskRecord>, BobbinError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let candidate = state
            .tasks
            .values()
            .filter(|t| t.is_claimable(request.now) && gate(&t.tenant_id))
            .min_by_key(|t| (t.next_attempt_at, t.created_at, t.id))
            .map(|t| t.id);

        let Some(task_id) = candidate else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        task.claim(
            request.worker_id.clone(),
            request.now,
            request.lease_expires_at,
        )?;
        Ok(Some(task.clone()))
    }

    async fn transition(
        &self,
        id: TaskId,
        worker: &WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, BobbinError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(BobbinError::TaskNotFound(id))?;
        task.apply(worker, transition, now)?;
        Ok(task.clone())
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, BobbinError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut reclaimed: Vec<TaskId> = state
            .tasks
            .values_mut()
            .filter_map(|t| t.reclaim(now).then_some(t.id))
            .collect();
        reclaimed.sort();
        Ok(reclaimed)
    }

    async fn cancel_tenant(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, BobbinError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut cancelled: Vec<TaskId> = state
            .tasks
            .values_mut()
            .filter(|t| &t.tenant_id == tenant_id)
            .filter_map(|t| t.cancel(now).then_some(t.id))
            .collect();
        cancelled.sort();
        Ok(cancelled)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, BobbinError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut result: Vec<_> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        result.sort_by_key(|t| (t.created_at, t.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn counts(&self, tenant_id: Option<&TenantId>) -> Result<TaskCounts, BobbinError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            if tenant_id.is_none_or(|t| &task.tenant_id == t) {
                counts.record(task.status);
            }
        }
        Ok(counts)
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.workers.insert(
            worker.clone(),
            WorkerHeartbeat {
                worker_id: worker.clone(),
                last_seen: now,
                expires_at,
            },
        );
        Ok(())
    }

    async fn live_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>, BobbinError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut live: Vec<_> = state
            .workers
            .values()
            .filter(|w| w.expires_at > now)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskStatus};
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn task(tenant: &str, created: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new(TenantId::parse(tenant).unwrap(), "echo", serde_json::json!({})),
            created,
        )
    }

    fn request(worker: &WorkerId, now: DateTime<Utc>) -> ClaimRequest<'_> {
        ClaimRequest {
            worker_id: worker,
            now,
            lease_expires_at: now + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn claims_oldest_due_task_first() {
        let store = InMemoryTaskStore::new();
        let older = task("t1", t0());
        let newer = task("t1", t0() + Duration::seconds(1));
        store.insert(newer.clone()).await.unwrap();
        store.insert(older.clone()).await.unwrap();

        let w = WorkerId::new("w1");
        let claimed = store
            .claim_next(request(&w, t0() + Duration::seconds(5)), &|_| true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
    }

    #[tokio::test]
    async fn gate_skips_blocked_tenants() {
        let store = InMemoryTaskStore::new();
        store.insert(task("t1", t0())).await.unwrap();
        let t2 = task("t2", t0() + Duration::seconds(1));
        store.insert(t2.clone()).await.unwrap();

        let w = WorkerId::new("w1");
        let claimed = store
            .claim_next(request(&w, t0() + Duration::seconds(5)), &|t| {
                t.as_str() != "t1"
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, t2.id);

        let none = store
            .claim_next(request(&w, t0() + Duration::seconds(5)), &|t| {
                t.as_str() != "t1"
            })
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn empty_claim_has_no_side_effects() {
        let store = InMemoryTaskStore::new();
        let w = WorkerId::new("w1");
        let claimed = store.claim_next(request(&w, t0()), &|_| true).await.unwrap();
        assert!(claimed.is_none());
        assert_eq!(store.counts(None).await.unwrap(), TaskCounts::default());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryTaskStore::new();
        store.set_available(false);

        let err = store.counts(None).await.unwrap_err();
        assert!(err.is_unavailable());

        let w = WorkerId::new("w1");
        assert!(store.claim_next(request(&w, t0()), &|_| true).await.is_err());

        store.set_available(true);
        assert!(store.counts(None).await.is_ok());
    }

    #[tokio::test]
    async fn heartbeats_expire() {
        let store = InMemoryTaskStore::new();
        let w = WorkerId::new("w1");
        store
            .heartbeat(&w, t0(), t0() + Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(store.live_workers(t0()).await.unwrap().len(), 1);
        assert!(
            store
                .live_workers(t0() + Duration::seconds(10))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryTaskStore::new();
        let t = task("t1", t0());
        store.insert(t.clone()).await.unwrap();
        assert!(matches!(
            store.insert(t).await,
            Err(BobbinError::DuplicateTask(_))
        ));
    }
}
