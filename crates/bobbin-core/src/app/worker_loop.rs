//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. heartbeat を TaskStore に記録
//! 2. ClaimManager::claim_next で 1 件取る（無ければ poll_interval 待つ）
//! 3. mark_running
//! 4. FunctionRegistry から handler を引き、timeout 付きで実行
//! 5. ClaimManager::release_or_fail で結果を報告
//!
//! handler の panic / timeout は transient な失敗として扱う。
//! shutdown は新しい claim を止めるだけで、実行中の handler は中断しない。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::claim::{ClaimManager, Resolution};
use crate::domain::{BobbinError, Outcome, TaskRecord, WorkerId};
use crate::typed::FunctionRegistry;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    pub heartbeat_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(30),
        }
    }
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// Nothing eligible (or the breaker is open).
    Idle,
    Processed(TaskRecord, Resolution),
    /// Someone else owns the task now; the report was dropped.
    LeaseLost(TaskRecord),
}

pub struct WorkerLoop {
    worker_id: WorkerId,
    claims: Arc<ClaimManager>,
    registry: Arc<FunctionRegistry>,
    settings: WorkerSettings,
}

impl WorkerLoop {
    pub fn new(
        worker_id: WorkerId,
        claims: Arc<ClaimManager>,
        registry: Arc<FunctionRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            worker_id,
            claims,
            registry,
            settings,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(e) = self
                .claims
                .heartbeat(&self.worker_id, self.settings.heartbeat_ttl)
                .await
            {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
            }

            let idle = match self.run_once().await {
                Ok(Tick::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // sender dropped: treat as shutdown
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Claim, execute and report at most one task.
    pub async fn run_once(&self) -> Result<Tick, BobbinError> {
        let Some(task) = self.claims.claim_next(&self.worker_id).await? else {
            return Ok(Tick::Idle);
        };

        match self.claims.mark_running(task.id, &self.worker_id).await {
            Ok(_) => {}
            Err(BobbinError::LeaseLost { .. }) => {
                tracing::warn!(task_id = %task.id, worker_id = %self.worker_id, "lease lost before start");
                return Ok(Tick::LeaseLost(task));
            }
            Err(e) => return Err(e),
        }

        let outcome = self.execute(&task).await;

        match self
            .claims
            .release_or_fail(task.id, &self.worker_id, outcome)
            .await
        {
            Ok(resolution) => Ok(Tick::Processed(task, resolution)),
            Err(BobbinError::LeaseLost { .. }) => {
                tracing::warn!(task_id = %task.id, worker_id = %self.worker_id, "lease lost, result discarded");
                Ok(Tick::LeaseLost(task))
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, task: &TaskRecord) -> Outcome {
        let Some(handler) = self.registry.get(task.capability.as_str()) else {
            return Outcome::permanent(format!("unknown capability: {}", task.capability));
        };

        let payload = task.payload.clone();
        let tenant_id = task.tenant_id.clone();
        // 別 task で動かすと panic が JoinError として返ってくる
        let mut join =
            tokio::spawn(async move { handler.handle_dyn(payload, &tenant_id).await });

        match tokio::time::timeout(self.settings.handler_timeout, &mut join).await {
            Ok(Ok(result)) => result.into(),
            Ok(Err(e)) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(task_id = %task.id, panic = %message, "handler panicked");
                Outcome::transient(format!("handler panicked: {message}"))
            }
            Ok(Err(e)) => Outcome::transient(format!("handler aborted: {e}")),
            Err(_) => {
                join.abort();
                tracing::warn!(
                    task_id = %task.id,
                    timeout_ms = self.settings.handler_timeout.as_millis() as u64,
                    "handler timed out"
                );
                Outcome::transient(format!(
                    "handler timed out after {}ms",
                    self.settings.handler_timeout.as_millis()
                ))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker group handle.
/// - `request_shutdown` で全ワーカーが新しい claim をやめる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    worker_ids: Vec<WorkerId>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(
        n: usize,
        claims: Arc<ClaimManager>,
        registry: Arc<FunctionRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        let mut worker_ids = Vec::with_capacity(n);
        for _ in 0..n {
            let worker = WorkerLoop::new(
                WorkerId::generate(),
                Arc::clone(&claims),
                Arc::clone(&registry),
                settings.clone(),
            );
            worker_ids.push(worker.worker_id().clone());
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        Self {
            shutdown_tx,
            worker_ids,
            joins,
        }
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::breaker::CircuitBreaker;
    use crate::app::flags::FlagReader;
    use crate::app::retry::RetryPolicy;
    use crate::domain::{HandlerError, NewTask, TaskStatus, TenantId};
    use crate::impls::{InMemoryDlqStore, InMemoryFlagStore, InMemoryTaskStore, MemoryEventSink};
    use crate::ports::{Clock, SystemClock, TaskStore, UlidGenerator};
    use crate::typed::{Handler, Task};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Task for Ping {
        const CAPABILITY: &'static str = "test.ping";
    }

    struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(
            &self,
            task: Ping,
            _tenant_id: &TenantId,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::json!({"pong": task.n}))
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Explode;

    impl Task for Explode {
        const CAPABILITY: &'static str = "test.explode";
    }

    struct ExplodeHandler;

    #[async_trait]
    impl Handler<Explode> for ExplodeHandler {
        async fn handle(
            &self,
            _task: Explode,
            _tenant_id: &TenantId,
        ) -> Result<serde_json::Value, HandlerError> {
            panic!("kaboom");
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Slow;

    impl Task for Slow {
        const CAPABILITY: &'static str = "test.slow";
    }

    struct SlowHandler;

    #[async_trait]
    impl Handler<Slow> for SlowHandler {
        async fn handle(
            &self,
            _task: Slow,
            _tenant_id: &TenantId,
        ) -> Result<serde_json::Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::Value::Null)
        }
    }

    async fn setup() -> (Arc<InMemoryTaskStore>, Arc<ClaimManager>, Arc<FunctionRegistry>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tasks = Arc::new(InMemoryTaskStore::new());
        let flags = Arc::new(InMemoryFlagStore::new(clock.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            FlagReader::new(flags, "test"),
            Arc::new(MemoryEventSink::new()),
            clock.clone(),
        ));
        breaker.set_emergency_stop(false, "test", "").await.unwrap();
        let claims = Arc::new(ClaimManager::new(
            tasks.clone(),
            Arc::new(InMemoryDlqStore::new()),
            breaker,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            RetryPolicy::default(),
            Duration::from_secs(30),
        ));

        let mut registry = FunctionRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();
        registry.register::<Explode, _>(ExplodeHandler).unwrap();
        registry.register::<Slow, _>(SlowHandler).unwrap();
        (tasks, claims, Arc::new(registry))
    }

    fn worker(claims: Arc<ClaimManager>, registry: Arc<FunctionRegistry>) -> WorkerLoop {
        WorkerLoop::new(
            WorkerId::new("w1"),
            claims,
            registry,
            WorkerSettings {
                poll_interval: Duration::from_millis(10),
                handler_timeout: Duration::from_millis(50),
                heartbeat_ttl: Duration::from_secs(30),
            },
        )
    }

    fn tenant() -> TenantId {
        TenantId::parse("t1").unwrap()
    }

    #[tokio::test]
    async fn idle_when_nothing_to_do() {
        let (_, claims, registry) = setup().await;
        let w = worker(claims, registry);
        assert_eq!(w.run_once().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn runs_handler_and_completes() {
        let (tasks, claims, registry) = setup().await;
        let task = claims
            .enqueue(Ping { n: 7 }.into_new_task(tenant()).unwrap())
            .await
            .unwrap();

        let w = worker(claims, registry);
        let tick = w.run_once().await.unwrap();
        assert!(matches!(tick, Tick::Processed(_, Resolution::Completed)));

        let stored = tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(serde_json::json!({"pong": 7})));
    }

    #[tokio::test]
    async fn unknown_capability_dead_letters_without_attempts() {
        let (_, claims, registry) = setup().await;
        claims
            .enqueue(NewTask::new(tenant(), "nobody.home", serde_json::json!({})))
            .await
            .unwrap();

        let w = worker(claims, registry);
        let tick = w.run_once().await.unwrap();
        assert!(matches!(
            tick,
            Tick::Processed(_, Resolution::DeadLettered { attempts: 0, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_payload_dead_letters_without_attempts() {
        let (_, claims, registry) = setup().await;
        claims
            .enqueue(NewTask::new(tenant(), "test.ping", serde_json::json!({"n": "x"})))
            .await
            .unwrap();

        let w = worker(claims, registry);
        let tick = w.run_once().await.unwrap();
        assert!(matches!(
            tick,
            Tick::Processed(_, Resolution::DeadLettered { attempts: 0, .. })
        ));
    }

    #[tokio::test]
    async fn panic_is_a_transient_failure() {
        let (tasks, claims, registry) = setup().await;
        let task = claims
            .enqueue(Explode.into_new_task(tenant()).unwrap())
            .await
            .unwrap();

        let w = worker(claims, registry);
        let tick = w.run_once().await.unwrap();
        assert!(matches!(
            tick,
            Tick::Processed(_, Resolution::Retrying { attempts: 1, .. })
        ));

        let stored = tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(
            stored
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("handler panicked: kaboom"))
        );
    }

    #[tokio::test]
    async fn timeout_is_a_transient_failure() {
        let (tasks, claims, registry) = setup().await;
        let task = claims
            .enqueue(Slow.into_new_task(tenant()).unwrap())
            .await
            .unwrap();

        let w = worker(claims, registry);
        let tick = w.run_once().await.unwrap();
        assert!(matches!(
            tick,
            Tick::Processed(_, Resolution::Retrying { attempts: 1, .. })
        ));
        let stored = tasks.get(task.id).await.unwrap().unwrap();
        assert!(
            stored
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("timed out"))
        );
    }

    #[tokio::test]
    async fn group_processes_and_heartbeats() {
        let (tasks, claims, registry) = setup().await;
        for n in 0..5 {
            claims
                .enqueue(Ping { n }.into_new_task(tenant()).unwrap())
                .await
                .unwrap();
        }

        let group = WorkerGroup::spawn(
            2,
            claims,
            registry,
            WorkerSettings {
                poll_interval: Duration::from_millis(10),
                handler_timeout: Duration::from_secs(1),
                heartbeat_ttl: Duration::from_secs(30),
            },
        );
        assert_eq!(group.worker_ids().len(), 2);

        let mut done = 0;
        for _ in 0..200 {
            done = tasks.counts(None).await.unwrap().completed;
            if done == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done, 5);
        assert_eq!(
            tasks.live_workers(chrono::Utc::now()).await.unwrap().len(),
            2
        );

        group.shutdown_and_join().await;
    }
}
