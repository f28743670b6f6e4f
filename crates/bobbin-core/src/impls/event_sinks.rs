//! EventSink 実装
//!
//! - TracingEventSink: `bobbin::audit` target への構造化ログ
//! - JsonlEventSink: 1 行 1 イベントのファイル追記
//! - MemoryEventSink: テスト用（記録したイベントを後から読める）

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::{AuditEvent, BobbinError};
use crate::ports::EventSink;

pub const AUDIT_TARGET: &str = "bobbin::audit";

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), BobbinError> {
        tracing::info!(
            target: AUDIT_TARGET,
            action = event.action.as_str(),
            actor = %event.actor,
            tenant_id = event.tenant_id.as_ref().map(|t| t.as_str()),
            reason = %event.reason,
            details = %event.details,
            "audit event"
        );
        Ok(())
    }
}

/// Appends each event as one JSON line.
pub struct JsonlEventSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), BobbinError> {
        let mut line =
            serde_json::to_string(&event).map_err(|e| BobbinError::EventSink(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                BobbinError::EventSink(format!("open {}: {e}", self.path.display()))
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| BobbinError::EventSink(format!("write {}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| BobbinError::EventSink(format!("flush {}: {e}", self.path.display())))
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), BobbinError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Fan out to several sinks; the first error wins but every sink is tried.
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), BobbinError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event.clone()).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
