//! bobbin-core
//!
//! Multi-tenant task runtime: lease-based claiming, bounded retries,
//! a dead-letter queue with guarded replay, and flag-driven kill switches.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, tenant, task, dlq, flag, outcome, health, events, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DlqStore, FlagStore, EventSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（builder, claim, worker_loop, reaper_loop, dlq, breaker, posture, admin）
//! - **typed**: 型付き Task API（Task trait, Handler trait, FunctionRegistry）
//! - **impls**: 実装（in-memory ストアと snapshot、event sink）
//! - **config / observability / trace**: TOML 設定、tracing 初期化、trace リンク

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod trace;
pub mod typed;

pub use app::{App, AppBuilder};
pub use config::RuntimeConfig;
pub use domain::{BobbinError, TenantId};
