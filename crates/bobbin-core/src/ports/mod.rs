//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。各 trait は永続化や外部システムへの
//! インターフェースで、実装は `impls` に置く。
//!
//! - TaskStore: タスクと lease、ワーカー heartbeat の正本
//! - DlqStore: dead-letter の保管
//! - FlagStore: feature flag
//! - EventSink: 監査イベント
//! - Clock / IdGenerator: テスト容易性のための抽象

pub mod clock;
pub mod dlq_store;
pub mod event_sink;
pub mod flag_store;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dlq_store::{DlqFilter, DlqStore};
pub use self::event_sink::EventSink;
pub use self::flag_store::FlagStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{
    ClaimRequest, TaskCounts, TaskFilter, TaskStore, TenantGate, WorkerHeartbeat,
};
