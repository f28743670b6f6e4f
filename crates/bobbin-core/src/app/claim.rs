//! ClaimManager - claim / lease / 完了報告
//!
//! # フロー
//! 1. CircuitBreaker の snapshot を取る（停止中なら store に触れずに None）
//! 2. TaskStore::claim_next で原子的に 1 件取る
//! 3. worker が mark_running → handler 実行 → release_or_fail
//! 4. 失敗は RetryPolicy で再スケジュール、尽きたら DLQ へ
//!
//! lease を失った worker の報告は `LeaseLost` で拒否され、何も変えない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::breaker::CircuitBreaker;
use super::retry::RetryPolicy;
use crate::domain::{
    BobbinError, DlqItem, DlqItemId, DlqStatus, NewTask, Outcome, TaskId, TaskRecord, Transition,
    WorkerId,
};
use crate::ports::{ClaimRequest, Clock, DlqStore, IdGenerator, TaskStore};

/// What `release_or_fail` did with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    Completed,
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
        dlq_item_id: DlqItemId,
    },
}

pub struct ClaimManager {
    tasks: Arc<dyn TaskStore>,
    dlq: Arc<dyn DlqStore>,
    breaker: Arc<CircuitBreaker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    lease_duration: Duration,
}

impl ClaimManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        dlq: Arc<dyn DlqStore>,
        breaker: Arc<CircuitBreaker>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        lease_duration: Duration,
    ) -> Self {
        Self {
            tasks,
            dlq,
            breaker,
            ids,
            clock,
            retry,
            lease_duration,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Insert a fresh queued task. Capability checks happen in `App::enqueue`.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, BobbinError> {
        let record = TaskRecord::new(self.ids.task_id(), task, self.clock.now());
        self.tasks.insert(record.clone()).await?;
        tracing::debug!(
            task_id = %record.id,
            tenant_id = %record.tenant_id,
            capability = %record.capability,
            "task enqueued"
        );
        Ok(record)
    }

    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<TaskRecord>, BobbinError> {
        let gate = self.breaker.snapshot().await;
        if gate.emergency_stop {
            return Ok(None);
        }

        let now = self.clock.now();
        let request = ClaimRequest {
            worker_id: worker,
            now,
            lease_expires_at: now + chrono_duration(self.lease_duration),
        };
        let claimed = self
            .tasks
            .claim_next(request, &|tenant| gate.allows(tenant))
            .await?;

        if let Some(task) = &claimed {
            tracing::debug!(
                task_id = %task.id,
                tenant_id = %task.tenant_id,
                worker_id = %worker,
                attempts = task.attempts,
                "task claimed"
            );
        }
        Ok(claimed)
    }

    /// Claimed -> running.
    pub async fn mark_running(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
    ) -> Result<TaskRecord, BobbinError> {
        self.tasks
            .transition(task_id, worker, Transition::Start, self.clock.now())
            .await
    }

    /// Report the outcome of one execution.
    pub async fn release_or_fail(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        outcome: Outcome,
    ) -> Result<Resolution, BobbinError> {
        let now = self.clock.now();

        let error = match outcome {
            Outcome::Success { result } => {
                self.tasks
                    .transition(task_id, worker, Transition::Complete { result }, now)
                    .await?;
                tracing::info!(task_id = %task_id, worker_id = %worker, "task completed");
                return Ok(Resolution::Completed);
            }
            Outcome::Failure { error } => error,
        };

        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or(BobbinError::TaskNotFound(task_id))?;
        if !task.is_held_by(worker) {
            return Err(BobbinError::LeaseLost {
                task_id,
                worker_id: worker.clone(),
            });
        }

        if error.is_permanent() {
            return self
                .dead_letter(&task, worker, error.to_string(), false, now)
                .await;
        }

        let attempts = task.attempts + 1;
        if self.retry.is_exhausted(attempts) {
            return self
                .dead_letter(&task, worker, error.to_string(), true, now)
                .await;
        }

        let next_attempt_at = now + chrono_duration(self.retry.next_delay(attempts));
        self.tasks
            .transition(
                task_id,
                worker,
                Transition::Retry {
                    error: error.to_string(),
                    next_attempt_at,
                },
                now,
            )
            .await?;
        tracing::warn!(
            task_id = %task_id,
            worker_id = %worker,
            attempts,
            max_attempts = self.retry.max_attempts,
            next_attempt_at = %next_attempt_at,
            error = %error,
            "task failed, retry scheduled"
        );
        Ok(Resolution::Retrying {
            attempts,
            next_attempt_at,
        })
    }

    // DLQ item を pending で先に作り、task の遷移に失敗したら取り消す。
    // pending の間は replay / quarantine の対象外なので、取り消しと競合しない。
    async fn dead_letter(
        &self,
        task: &TaskRecord,
        worker: &WorkerId,
        error: String,
        consume_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<Resolution, BobbinError> {
        let attempts = task.attempts + u32::from(consume_attempt);
        let mut item = DlqItem::from_task(self.ids.dlq_item_id(), task, attempts, &error, now);
        item.status = DlqStatus::Pending;
        let dlq_item_id = item.id;
        self.dlq.insert(item).await?;

        let transition = Transition::DeadLetter {
            error: error.clone(),
            consume_attempt,
        };
        if let Err(e) = self.tasks.transition(task.id, worker, transition, now).await {
            if let Err(undo) = self.dlq.remove(dlq_item_id).await {
                tracing::error!(
                    task_id = %task.id,
                    dlq_item_id = %dlq_item_id,
                    error = %undo,
                    "failed to roll back dlq item"
                );
            }
            return Err(e);
        }

        // task はもう dead_lettered なので、ここで失敗しても結果は変えない
        if let Err(e) = self
            .dlq
            .set_status(&task.tenant_id, dlq_item_id, DlqStatus::Failed, None)
            .await
        {
            tracing::error!(
                task_id = %task.id,
                dlq_item_id = %dlq_item_id,
                error = %e,
                "dlq item left pending"
            );
        }

        tracing::warn!(
            task_id = %task.id,
            tenant_id = %task.tenant_id,
            dlq_item_id = %dlq_item_id,
            attempts,
            error = %error,
            "task dead-lettered"
        );
        Ok(Resolution::DeadLettered {
            attempts,
            dlq_item_id,
        })
    }

    /// Return expired leases to the queue. Attempts are untouched.
    pub async fn sweep_expired(&self) -> Result<Vec<TaskId>, BobbinError> {
        let reclaimed = self.tasks.reclaim_expired(self.clock.now()).await?;
        if !reclaimed.is_empty() {
            tracing::warn!(count = reclaimed.len(), "expired leases reclaimed");
        }
        Ok(reclaimed)
    }

    pub async fn heartbeat(&self, worker: &WorkerId, ttl: Duration) -> Result<(), BobbinError> {
        let now = self.clock.now();
        self.tasks
            .heartbeat(worker, now, now + chrono_duration(ttl))
            .await
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::flags::FlagReader;
    use crate::domain::{DlqStatus, HandlerError, TaskStatus, TenantId};
    use crate::impls::{InMemoryDlqStore, InMemoryFlagStore, InMemoryTaskStore, MemoryEventSink};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;

    struct Fixture {
        clock: FixedClock,
        tasks: Arc<InMemoryTaskStore>,
        dlq: Arc<InMemoryDlqStore>,
        breaker: Arc<CircuitBreaker>,
        claims: ClaimManager,
    }

    async fn fixture() -> Fixture {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let dlq = Arc::new(InMemoryDlqStore::new());
        let flags = Arc::new(InMemoryFlagStore::new(shared.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            FlagReader::new(flags, "test"),
            Arc::new(MemoryEventSink::new()),
            shared.clone(),
        ));
        breaker.set_emergency_stop(false, "test", "").await.unwrap();
        let claims = ClaimManager::new(
            tasks.clone(),
            dlq.clone(),
            breaker.clone(),
            Arc::new(UlidGenerator::new(shared.clone())),
            shared,
            RetryPolicy::default(),
            Duration::from_secs(30),
        );
        Fixture {
            clock,
            tasks,
            dlq,
            breaker,
            claims,
        }
    }

    fn new_task(tenant: &str) -> NewTask {
        NewTask::new(TenantId::parse(tenant).unwrap(), "echo", serde_json::json!({}))
    }

    #[tokio::test]
    async fn success_completes_task() {
        let f = fixture().await;
        let w = WorkerId::new("w1");
        let task = f.claims.enqueue(new_task("t1")).await.unwrap();

        let claimed = f.claims.claim_next(&w).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(
            claimed.lease_expires_at,
            Some(f.clock.now() + chrono::Duration::seconds(30))
        );
        f.claims.mark_running(task.id, &w).await.unwrap();

        let resolution = f
            .claims
            .release_or_fail(task.id, &w, Outcome::success_with(serde_json::json!(1)))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Completed);

        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn transient_failure_backs_off() {
        let f = fixture().await;
        let w = WorkerId::new("w1");
        let task = f.claims.enqueue(new_task("t1")).await.unwrap();
        f.claims.claim_next(&w).await.unwrap().unwrap();

        let resolution = f
            .claims
            .release_or_fail(task.id, &w, Outcome::transient("timeout"))
            .await
            .unwrap();
        let expected_at = f.clock.now() + chrono::Duration::seconds(2);
        assert_eq!(
            resolution,
            Resolution::Retrying {
                attempts: 1,
                next_attempt_at: expected_at
            }
        );

        // not due yet
        assert!(f.claims.claim_next(&w).await.unwrap().is_none());
        f.clock.advance(chrono::Duration::seconds(2));
        let again = f.claims.claim_next(&w).await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let f = fixture().await;
        let w = WorkerId::new("w1");
        let task = f.claims.enqueue(new_task("t1")).await.unwrap();

        let mut last = None;
        for _ in 0..3 {
            f.clock.advance(chrono::Duration::minutes(10));
            f.claims.claim_next(&w).await.unwrap().unwrap();
            last = Some(
                f.claims
                    .release_or_fail(task.id, &w, Outcome::transient("boom"))
                    .await
                    .unwrap(),
            );
        }

        assert!(matches!(
            last,
            Some(Resolution::DeadLettered { attempts: 3, .. })
        ));
        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLettered);
        assert_eq!(stored.attempts, 3);

        let (items, _) = f.dlq.export().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 3);
        assert_eq!(items[0].source_task_id, task.id);
        assert!(items[0].last_error.contains("boom"));
        assert_eq!(items[0].status, DlqStatus::Failed);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let f = fixture().await;
        let w = WorkerId::new("w1");
        let task = f.claims.enqueue(new_task("t1")).await.unwrap();
        f.claims.claim_next(&w).await.unwrap().unwrap();

        let resolution = f
            .claims
            .release_or_fail(
                task.id,
                &w,
                Outcome::Failure {
                    error: HandlerError::permanent("unknown capability: echo"),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            resolution,
            Resolution::DeadLettered { attempts: 0, .. }
        ));
    }

    #[tokio::test]
    async fn stale_worker_report_is_rejected() {
        let f = fixture().await;
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        let task = f.claims.enqueue(new_task("t1")).await.unwrap();
        f.claims.claim_next(&w1).await.unwrap().unwrap();

        f.clock.advance(chrono::Duration::seconds(31));
        assert_eq!(f.claims.sweep_expired().await.unwrap(), vec![task.id]);
        f.claims.claim_next(&w2).await.unwrap().unwrap();

        let err = f
            .claims
            .release_or_fail(task.id, &w1, Outcome::transient("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, BobbinError::LeaseLost { .. }));
        assert!(f.dlq.export().await.0.is_empty());

        let stored = f.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.claimed_by, Some(w2));
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn emergency_stop_prevents_claims() {
        let f = fixture().await;
        let w = WorkerId::new("w1");
        f.claims.enqueue(new_task("t1")).await.unwrap();

        f.breaker.set_emergency_stop(true, "test", "").await.unwrap();
        assert!(f.claims.claim_next(&w).await.unwrap().is_none());

        f.breaker.set_emergency_stop(false, "test", "").await.unwrap();
        assert!(f.claims.claim_next(&w).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn paused_tenant_is_skipped() {
        let f = fixture().await;
        let t1 = TenantId::parse("t1").unwrap();
        f.breaker
            .set_tenant_paused(&t1, true, "test", "")
            .await
            .unwrap();
        f.claims.enqueue(new_task("t1")).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(1));
        let t2_task = f.claims.enqueue(new_task("t2")).await.unwrap();

        let w = WorkerId::new("w1");
        let claimed = f.claims.claim_next(&w).await.unwrap().unwrap();
        assert_eq!(claimed.id, t2_task.id);
        assert!(f.claims.claim_next(&w).await.unwrap().is_none());
    }
}
