//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **ClaimManager**: claim / lease / 完了報告 / リトライと dead-letter
//! - **WorkerLoop / WorkerGroup**: タスク実行ループ（claim→running→handle→report）
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **CircuitBreaker**: emergency stop と tenant pause
//! - **DlqManager**: dead-letter の閲覧・dry run・replay・隔離
//! - **HealthAggregator / HealthMonitor**: GREEN / YELLOW / RED
//! - **AdminControlPlane**: 運用コマンドの表面

pub mod admin;
pub mod breaker;
pub mod builder;
pub mod claim;
pub mod dlq;
pub mod flags;
pub mod posture;
pub mod reaper_loop;
pub mod retry;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::admin::{AdminControlPlane, AdminResult, DlqAction, DlqRequest, DlqResponse};
pub use self::breaker::{BreakerSnapshot, CircuitBreaker};
pub use self::builder::{App, AppBuilder, BuildError, RunningApp};
pub use self::claim::{ClaimManager, Resolution};
pub use self::dlq::{
    DlqAnalysis, DlqManager, DrainReport, ReplayBudget, ReplayPlan, ReplayReport, ReplayRequest,
    SkipReason, plan_replay,
};
pub use self::flags::FlagReader;
pub use self::posture::{HealthAggregator, HealthMonitor, HealthThresholds};
pub use self::reaper_loop::ReaperLoop;
pub use self::retry::RetryPolicy;
pub use self::worker_loop::{Tick, WorkerGroup, WorkerLoop, WorkerSettings};
