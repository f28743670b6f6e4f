//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock から timestamp を取る）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{DlqItemId, TaskId};
use crate::ports::Clock;

/// IdGenerator は分散環境で衝突しない ID を生成
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn dlq_item_id(&self) -> DlqItemId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// FixedClock を渡せば timestamp 部分が決定的になる（ランダム部分は異なる）。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next())
    }

    fn dlq_item_id(&self) -> DlqItemId {
        DlqItemId::from_ulid(self.next())
    }
}
