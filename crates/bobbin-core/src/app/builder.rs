//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! - 起動時検証（Fail-fast）: expect_capabilities() の集合が登録済みでなければ build() が失敗する
//! - 未指定のポートは開発用の既定（SystemClock / MemoryBackend / TracingEventSink）で埋める
//! - App は enqueue と管理操作の表面、start() で worker / reaper / health monitor を起動する

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::admin::AdminControlPlane;
use super::breaker::CircuitBreaker;
use super::claim::ClaimManager;
use super::dlq::DlqManager;
use super::flags::FlagReader;
use super::posture::{HealthAggregator, HealthMonitor};
use super::reaper_loop::ReaperLoop;
use super::worker_loop::{WorkerGroup, WorkerLoop};
use crate::config::{ConfigError, RuntimeConfig};
use crate::domain::{BobbinError, HealthPosture, NewTask, TaskRecord, TenantId, WorkerId};
use crate::impls::{MemoryBackend, StateFile, TracingEventSink};
use crate::ports::{
    Clock, DlqStore, EventSink, FlagStore, IdGenerator, SystemClock, TaskStore, UlidGenerator,
};
use crate::trace::TraceLinkBuilder;
use crate::typed::{FunctionRegistry, Handler, RegistryError, Task};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<GenerateInvoice, _>(InvoiceHandler)?
///     .expect_capabilities(&["billing.invoice.generate.v1"])
///     .build()?;
/// ```
pub struct AppBuilder {
    registry: FunctionRegistry,
    expected: Option<Vec<String>>,
    config: RuntimeConfig,
    actor: String,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    tasks: Option<Arc<dyn TaskStore>>,
    dlq: Option<Arc<dyn DlqStore>>,
    flags: Option<Arc<dyn FlagStore>>,
    events: Option<Arc<dyn EventSink>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing capabilities: {0:?}. These capabilities were expected but not registered.")]
    MissingCapabilities(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            expected: None,
            config: RuntimeConfig::default(),
            actor: "system".to_string(),
            clock: None,
            ids: None,
            tasks: None,
            dlq: None,
            flags: None,
            events: None,
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.expected = Some(capabilities.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Operator name recorded on admin actions.
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn dlq_store(mut self, dlq: Arc<dyn DlqStore>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn flag_store(mut self, flags: Arc<dyn FlagStore>) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Use all three stores of a memory backend.
    pub fn backend(self, backend: &MemoryBackend) -> Self {
        self.task_store(backend.tasks.clone())
            .dlq_store(backend.dlq.clone())
            .flag_store(backend.flags.clone())
    }

    /// Use one shared state file for all three stores.
    pub fn state_file(self, file: Arc<StateFile>) -> Self {
        self.task_store(file.clone())
            .dlq_store(file.clone())
            .flag_store(file)
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// # 検証
    /// - config の値域
    /// - expect_capabilities() の集合 ⊆ 登録済み集合
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|c| !self.registry.contains(c))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingCapabilities(missing));
            }
        }

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(clock.clone())),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(TracingEventSink),
        };

        let (tasks, dlq, flag_store) = match (self.tasks, self.dlq, self.flags) {
            (Some(tasks), Some(dlq), Some(flags)) => (tasks, dlq, flags),
            (tasks, dlq, flags) => {
                let backend = MemoryBackend::new(clock.clone());
                let default_tasks: Arc<dyn TaskStore> = backend.tasks;
                let default_dlq: Arc<dyn DlqStore> = backend.dlq;
                let default_flags: Arc<dyn FlagStore> = backend.flags;
                (
                    tasks.unwrap_or(default_tasks),
                    dlq.unwrap_or(default_dlq),
                    flags.unwrap_or(default_flags),
                )
            }
        };

        let flags = FlagReader::new(flag_store, self.config.environment.clone());
        let breaker = Arc::new(CircuitBreaker::new(
            flags.clone(),
            events.clone(),
            clock.clone(),
        ));
        let claims = Arc::new(ClaimManager::new(
            tasks.clone(),
            dlq.clone(),
            breaker.clone(),
            ids.clone(),
            clock.clone(),
            self.config.retry_policy(),
            self.config.lease_duration(),
        ));
        let dlq_manager = Arc::new(DlqManager::new(
            tasks.clone(),
            dlq.clone(),
            breaker.clone(),
            ids,
            clock.clone(),
            events,
            self.config.replay_budget(),
        ));
        let health = Arc::new(HealthAggregator::new(
            flags,
            tasks,
            dlq,
            clock.clone(),
            self.config.health_thresholds(),
        ));
        let admin = AdminControlPlane::new(
            breaker.clone(),
            dlq_manager.clone(),
            health.clone(),
            clock,
            self.actor,
        );
        let trace_links = TraceLinkBuilder::new(self.config.trace.url_template.clone());

        tracing::debug!(
            capabilities = ?self.registry.capabilities(),
            environment = %self.config.environment,
            "app built"
        );

        Ok(App {
            config: self.config,
            registry: Arc::new(self.registry),
            breaker,
            claims,
            dlq: dlq_manager,
            health,
            admin,
            trace_links,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App はワイヤリング済みのランタイム（まだ何も起動していない）
pub struct App {
    config: RuntimeConfig,
    registry: Arc<FunctionRegistry>,
    breaker: Arc<CircuitBreaker>,
    claims: Arc<ClaimManager>,
    dlq: Arc<DlqManager>,
    health: Arc<HealthAggregator>,
    admin: AdminControlPlane,
    trace_links: Option<TraceLinkBuilder>,
}

impl App {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn claims(&self) -> &Arc<ClaimManager> {
        &self.claims
    }

    pub fn dlq(&self) -> &DlqManager {
        &self.dlq
    }

    pub fn admin(&self) -> &AdminControlPlane {
        &self.admin
    }

    pub fn trace_link(&self, task: &TaskRecord) -> Option<String> {
        self.trace_links
            .as_ref()
            .and_then(|links| links.link_opt(task.trace_id.as_ref()))
    }

    /// Unregistered capabilities are rejected here rather than dead-lettered later.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, BobbinError> {
        if !self.registry.contains(task.capability.as_str()) {
            return Err(BobbinError::UnknownCapability(
                task.capability.as_str().to_string(),
            ));
        }
        self.claims.enqueue(task).await
    }

    pub async fn enqueue_typed<T: Task>(
        &self,
        tenant_id: TenantId,
        task: T,
    ) -> Result<TaskRecord, BobbinError> {
        let task = task
            .into_new_task(tenant_id)
            .map_err(|e| BobbinError::InvalidInput(format!("payload encode failed: {e}")))?;
        self.enqueue(task).await
    }

    /// A single worker on this app's registry, for driving `run_once` by hand.
    pub fn worker(&self, worker_id: WorkerId) -> WorkerLoop {
        WorkerLoop::new(
            worker_id,
            self.claims.clone(),
            self.registry.clone(),
            self.config.worker_settings(),
        )
    }

    pub async fn status(&self) -> HealthPosture {
        self.health.compute().await
    }

    /// Spawn `worker.count` workers, the lease reaper and the health monitor.
    pub async fn start(&self) -> RunningApp {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = WorkerGroup::spawn(
            self.config.worker.count,
            self.claims.clone(),
            self.registry.clone(),
            self.config.worker_settings(),
        );
        let reaper = ReaperLoop::new(self.claims.clone(), self.config.sweep_interval())
            .spawn(shutdown_rx.clone());
        let monitor = HealthMonitor::start(
            self.health.clone(),
            self.config.health_interval(),
            shutdown_rx,
        )
        .await;

        tracing::info!(
            workers = self.config.worker.count,
            capabilities = ?self.registry.capabilities(),
            "runtime started"
        );

        RunningApp {
            shutdown_tx,
            workers,
            reaper,
            monitor,
        }
    }
}

pub struct RunningApp {
    shutdown_tx: watch::Sender<bool>,
    workers: WorkerGroup,
    reaper: JoinHandle<()>,
    monitor: HealthMonitor,
}

impl RunningApp {
    pub fn worker_ids(&self) -> &[WorkerId] {
        self.workers.worker_ids()
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Workers finish their current task first.
    pub async fn shutdown(self) {
        self.workers.shutdown_and_join().await;
        // ignore send error: background loops may already be gone
        let _ = self.shutdown_tx.send(true);
        let _ = self.reaper.await;
        self.monitor.join().await;
        tracing::info!("runtime stopped");
    }
}
