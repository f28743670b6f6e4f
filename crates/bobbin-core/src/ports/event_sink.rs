//! EventSink port - 監査イベントの記録
//!
//! # 実装
//! - TracingEventSink: `bobbin::audit` target に構造化ログとして出す
//! - JsonlEventSink: ファイルに 1 行 1 イベントで追記
//! - MemoryEventSink: テスト用

use async_trait::async_trait;

use crate::domain::{AuditEvent, BobbinError};

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), BobbinError>;
}
