//! Runtime configuration (TOML).
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Durations are plain integers with the unit in the key.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::dlq::ReplayBudget;
use crate::app::posture::HealthThresholds;
use crate::app::retry::RetryPolicy;
use crate::app::worker_loop::WorkerSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flag environment (`production`, `staging`, ...).
    pub environment: String,
    pub lease: LeaseConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub dlq: DlqConfig,
    pub health: HealthConfig,
    pub trace: TraceConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            lease: LeaseConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            dlq: DlqConfig::default(),
            health: HealthConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub duration_secs: u64,
    /// How often the reaper returns expired leases to the queue.
    pub sweep_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            sweep_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub poll_interval_ms: u64,
    pub handler_timeout_secs: u64,
    /// A worker is considered live this long after its last heartbeat.
    pub heartbeat_ttl_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval_ms: 1_000,
            handler_timeout_secs: 30,
            heartbeat_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub replay_max_batch: usize,
    pub replay_max_payload_bytes: u64,
    /// Replay runs per tenant in any rolling 24 hours.
    pub replay_per_tenant_per_day: usize,
    /// Fail rate of replayed tasks (0.0 - 1.0) flagged by analyze.
    pub replay_fail_threshold: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            replay_max_batch: 50,
            replay_max_payload_bytes: 2 * 1024 * 1024,
            replay_per_tenant_per_day: 3,
            replay_fail_threshold: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub queue_backlog_threshold: usize,
    pub dlq_backlog_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            queue_backlog_threshold: 100,
            dlq_backlog_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Viewer URL with a `{trace_id}` placeholder.
    pub url_template: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            url_template: "http://localhost:16686/trace/{trace_id}".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `None` falls back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("lease.duration_secs", self.lease.duration_secs),
            ("lease.sweep_interval_secs", self.lease.sweep_interval_secs),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
            ("worker.handler_timeout_secs", self.worker.handler_timeout_secs),
            ("worker.heartbeat_ttl_secs", self.worker.heartbeat_ttl_secs),
            ("retry.base_delay_ms", self.retry.base_delay_ms),
            ("retry.max_delay_secs", self.retry.max_delay_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("dlq.replay_max_payload_bytes", self.dlq.replay_max_payload_bytes),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        if self.worker.count == 0 {
            return Err(ConfigError::Invalid("worker.count must be greater than 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.dlq.replay_max_batch == 0 {
            return Err(ConfigError::Invalid(
                "dlq.replay_max_batch must be greater than 0".into(),
            ));
        }
        if self.dlq.replay_per_tenant_per_day == 0 {
            return Err(ConfigError::Invalid(
                "dlq.replay_per_tenant_per_day must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dlq.replay_fail_threshold) {
            return Err(ConfigError::Invalid(
                "dlq.replay_fail_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        // lease が handler より先に切れると、実行中のタスクが別 worker に渡る
        if self.lease.duration_secs <= self.worker.handler_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "lease.duration_secs ({}) must be greater than worker.handler_timeout_secs ({})",
                self.lease.duration_secs, self.worker.handler_timeout_secs
            )));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".into()));
        }
        if !self.trace.url_template.contains("{trace_id}") {
            return Err(ConfigError::Invalid(
                "trace.url_template must contain {trace_id}".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease.duration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lease.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.handler_timeout_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.worker.heartbeat_ttl_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn replay_budget(&self) -> ReplayBudget {
        ReplayBudget {
            max_batch: self.dlq.replay_max_batch,
            max_payload_bytes: self.dlq.replay_max_payload_bytes,
            per_tenant_per_day: self.dlq.replay_per_tenant_per_day,
            fail_threshold: self.dlq.replay_fail_threshold,
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            queue_backlog: self.health.queue_backlog_threshold,
            dlq_backlog: self.health.dlq_backlog_threshold,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: self.poll_interval(),
            handler_timeout: self.handler_timeout(),
            heartbeat_ttl: self.heartbeat_ttl(),
        }
    }
}
