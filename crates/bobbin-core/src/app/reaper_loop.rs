//! ReaperLoop - Lease 期限切れの回収
//!
//! lease が切れた claimed / running のタスクを queued に戻す。
//! attempts は変えない（crash は失敗として数えない）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::claim::ClaimManager;

pub struct ReaperLoop {
    claims: Arc<ClaimManager>,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(claims: Arc<ClaimManager>, interval: Duration) -> Self {
        Self { claims, interval }
    }

    /// One sweep. Returns how many tasks went back to the queue.
    pub async fn tick(&self) -> usize {
        match self.claims.sweep_expired().await {
            Ok(ids) => {
                for id in &ids {
                    tracing::info!(task_id = %id, "lease expired, task requeued");
                }
                ids.len()
            }
            Err(e) => {
                tracing::warn!(error = %e, "lease sweep failed");
                0
            }
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::debug!("reaper stopped");
    }

    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }
}
