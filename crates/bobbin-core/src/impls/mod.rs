//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryDlqStore / InMemoryFlagStore**: 単一プロセス用のストア
//! - **MemoryBackend / Snapshot**: 上記 3 つの束と JSON ファイルへの退避
//! - **StateFile**: ロック付き JSON ファイル上の 3 ストア（CLI のプロセス間で共有）
//! - **TracingEventSink / JsonlEventSink / MemoryEventSink**: 監査イベントの出力先
//!
//! # 本番用実装
//! 共有データベース上の実装は別クレートに置く想定。ports の trait だけに依存すること。

pub mod event_sinks;
pub mod inmem_dlq_store;
pub mod inmem_flag_store;
pub mod inmem_task_store;
pub mod snapshot;
pub mod state_file;

pub use self::event_sinks::{
    AUDIT_TARGET, FanoutEventSink, JsonlEventSink, MemoryEventSink, TracingEventSink,
};
pub use self::inmem_dlq_store::InMemoryDlqStore;
pub use self::inmem_flag_store::InMemoryFlagStore;
pub use self::inmem_task_store::InMemoryTaskStore;
pub use self::snapshot::{MemoryBackend, Snapshot};
pub use self::state_file::StateFile;
