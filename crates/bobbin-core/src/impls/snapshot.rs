//! In-memory backend with JSON snapshot persistence.
//!
//! `Snapshot` はストア 3 つ分の状態をまるごと JSON にしたもの。
//! 複数プロセスで共有するときは `StateFile`（ロック付きの読み込み → 操作 → 書き戻し）を使う。

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{BobbinError, DlqItem, FeatureFlag, ReplayRun, TaskRecord};
use crate::ports::{Clock, WorkerHeartbeat};

use super::{InMemoryDlqStore, InMemoryFlagStore, InMemoryTaskStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub workers: Vec<WorkerHeartbeat>,
    #[serde(default)]
    pub dlq: Vec<DlqItem>,
    #[serde(default)]
    pub replays: Vec<ReplayRun>,
    #[serde(default)]
    pub flags: Vec<FeatureFlag>,
}

impl Snapshot {
    /// Missing file reads as an empty snapshot.
    pub fn load(path: &Path) -> Result<Self, BobbinError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            BobbinError::StoreUnavailable(format!("read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BobbinError::InvalidInput(format!("corrupt state file {}: {e}", path.display()))
        })
    }

    /// Write via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), BobbinError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BobbinError::InvalidInput(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, path))
            .map_err(|e| BobbinError::StoreUnavailable(format!("write {}: {e}", path.display())))
    }
}

/// The three in-memory stores, shared by `Arc`.
#[derive(Clone)]
pub struct MemoryBackend {
    pub tasks: Arc<InMemoryTaskStore>,
    pub dlq: Arc<InMemoryDlqStore>,
    pub flags: Arc<InMemoryFlagStore>,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::restore(clock, Snapshot::default())
    }

    pub fn restore(clock: Arc<dyn Clock>, snapshot: Snapshot) -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskStore::from_parts(
                snapshot.tasks,
                snapshot.workers,
            )),
            dlq: Arc::new(InMemoryDlqStore::from_parts(snapshot.dlq, snapshot.replays)),
            flags: Arc::new(InMemoryFlagStore::from_flags(clock, snapshot.flags)),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let (tasks, workers) = self.tasks.export().await;
        let (dlq, replays) = self.dlq.export().await;
        Snapshot {
            tasks,
            workers,
            dlq,
            replays,
            flags: self.flags.export().await,
        }
    }
}
