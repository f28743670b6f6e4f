#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bobbin_core::app::{Tick, WorkerLoop};
use bobbin_core::domain::{
    BobbinError, HandlerError, TaskId, TaskRecord, TenantId, Transition, WorkerId,
};
use bobbin_core::impls::{InMemoryTaskStore, MemoryBackend, MemoryEventSink};
use bobbin_core::ports::{
    ClaimRequest, Clock, FixedClock, TaskCounts, TaskFilter, TaskStore, TenantGate,
    WorkerHeartbeat,
};
use bobbin_core::typed::{Handler, Task};
use bobbin_core::{App, AppBuilder, RuntimeConfig};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize)]
pub struct EchoTask {
    pub n: u32,
}

impl Task for EchoTask {
    const CAPABILITY: &'static str = "test.echo.v1";
}

pub struct EchoHandler;

#[async_trait]
impl Handler<EchoTask> for EchoHandler {
    async fn handle(
        &self,
        task: EchoTask,
        _tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({ "n": task.n }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlwaysFailTask {
    pub n: u32,
}

impl Task for AlwaysFailTask {
    const CAPABILITY: &'static str = "test.always_fail.v1";
}

pub struct AlwaysFailHandler;

#[async_trait]
impl Handler<AlwaysFailTask> for AlwaysFailHandler {
    async fn handle(
        &self,
        _task: AlwaysFailTask,
        _tenant_id: &TenantId,
    ) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::transient("downstream unavailable"))
    }
}

/// Task store that fails on demand, for the rollback paths.
pub struct FaultyTaskStore {
    inner: Arc<InMemoryTaskStore>,
    fail_dead_letter: AtomicBool,
    inserts_left: Mutex<Option<usize>>,
}

impl FaultyTaskStore {
    pub fn new(inner: Arc<InMemoryTaskStore>) -> Self {
        Self {
            inner,
            fail_dead_letter: AtomicBool::new(false),
            inserts_left: Mutex::new(None),
        }
    }

    /// Make the dead-letter transition fail.
    pub fn fail_dead_letter(&self, fail: bool) {
        self.fail_dead_letter.store(fail, Ordering::SeqCst);
    }

    /// Let `n` more inserts through, then fail every insert. `None` heals.
    pub fn fail_inserts_after(&self, n: Option<usize>) {
        *self.inserts_left.lock().unwrap() = n;
    }

    fn outage(what: &str) -> BobbinError {
        BobbinError::StoreUnavailable(format!("injected {what} failure"))
    }
}

#[async_trait]
impl TaskStore for FaultyTaskStore {
    async fn insert(&self, task: TaskRecord) -> Result<(), BobbinError> {
        {
            let mut left = self.inserts_left.lock().unwrap();
            match left.as_mut() {
                Some(0) => return Err(Self::outage("insert")),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.inner.insert(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, BobbinError> {
        self.inner.get(id).await
    }

    async fn claim_next(
        &self,
        request: ClaimRequest<'_>,
        gate: TenantGate<'_>,
    ) -> Result<Option<TaskRecord>, BobbinError> {
        self.inner.claim_next(request, gate).await
    }

    async fn transition(
        &self,
        id: TaskId,
        worker: &WorkerId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, BobbinError> {
        if matches!(transition, Transition::DeadLetter { .. })
            && self.fail_dead_letter.load(Ordering::SeqCst)
        {
            return Err(Self::outage("dead-letter"));
        }
        self.inner.transition(id, worker, transition, now).await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, BobbinError> {
        self.inner.reclaim_expired(now).await
    }

    async fn cancel_tenant(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, BobbinError> {
        self.inner.cancel_tenant(tenant_id, now).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, BobbinError> {
        self.inner.list(filter).await
    }

    async fn counts(&self, tenant_id: Option<&TenantId>) -> Result<TaskCounts, BobbinError> {
        self.inner.counts(tenant_id).await
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BobbinError> {
        self.inner.heartbeat(worker, now, expires_at).await
    }

    async fn live_workers(&self, now: DateTime<Utc>) -> Result<Vec<WorkerHeartbeat>, BobbinError> {
        self.inner.live_workers(now).await
    }
}

pub fn tenant(s: &str) -> TenantId {
    TenantId::parse(s).unwrap()
}

pub struct Harness {
    pub clock: FixedClock,
    pub backend: MemoryBackend,
    /// The app's task store: `backend.tasks` behind fault switches.
    pub faults: Arc<FaultyTaskStore>,
    pub events: Arc<MemoryEventSink>,
    pub app: App,
}

impl Harness {
    /// Default config, emergency stop cleared.
    pub async fn new() -> Self {
        Self::with_config(RuntimeConfig::default()).await
    }

    pub async fn with_config(config: RuntimeConfig) -> Self {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let backend = MemoryBackend::new(shared.clone());
        let faults = Arc::new(FaultyTaskStore::new(backend.tasks.clone()));
        let events = Arc::new(MemoryEventSink::new());

        let app = AppBuilder::new()
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .register::<AlwaysFailTask, _>(AlwaysFailHandler)
            .unwrap()
            .config(config)
            .actor("ops")
            .clock(shared)
            .backend(&backend)
            .task_store(faults.clone())
            .event_sink(events.clone())
            .build()
            .unwrap();

        let resumed = app.admin().resume("test setup").await;
        assert!(resumed.success, "{}", resumed.message);

        Self {
            clock,
            backend,
            faults,
            events,
            app,
        }
    }

    pub fn tasks(&self) -> &InMemoryTaskStore {
        &self.backend.tasks
    }

    pub async fn enqueue_echo(&self, tenant_id: &TenantId, n: u32) -> TaskRecord {
        self.app
            .enqueue_typed(tenant_id.clone(), EchoTask { n })
            .await
            .unwrap()
    }

    pub async fn enqueue_failing(&self, tenant_id: &TenantId, n: u32) -> TaskRecord {
        self.app
            .enqueue_typed(tenant_id.clone(), AlwaysFailTask { n })
            .await
            .unwrap()
    }

    /// Run `worker` until it finds nothing eligible. Returns how many ticks did work.
    pub async fn run_until_idle(&self, worker: &WorkerLoop) -> usize {
        let mut processed = 0;
        loop {
            match worker.run_once().await.unwrap() {
                Tick::Idle => return processed,
                _ => processed += 1,
            }
        }
    }

    /// Keep working and stepping past retry backoff until nothing is left.
    pub async fn run_to_quiescence(&self, worker: &WorkerLoop) {
        for _ in 0..10 {
            self.run_until_idle(worker).await;
            self.clock.advance(chrono::Duration::minutes(10));
        }
    }
}
