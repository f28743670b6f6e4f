//! DlqManager - dead-letter の閲覧・再投入・隔離と tenant 単位の管理操作
//!
//! dry_run と replay は同じ planner（`plan_replay`）を通るので、
//! 同じ入力・同じ状態なら replay の件数は dry_run の予測と一致する。
//!
//! 実行した replay は DlqStore に記録し、tenant ごとの 1 日あたりの回数制限と
//! replay したタスクの失敗率（analyze）に使う。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::breaker::CircuitBreaker;
use crate::domain::{
    AuditAction, AuditEvent, BobbinError, DlqItem, DlqItemId, DlqStatus, ReplayRun, TaskId,
    TaskRecord, TaskStatus, TenantId,
};
use crate::ports::{Clock, DlqFilter, DlqStore, EventSink, IdGenerator, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayBudget {
    pub max_batch: usize,
    pub max_payload_bytes: u64,
    /// Replay runs allowed per tenant in any rolling 24 hours.
    pub per_tenant_per_day: usize,
    /// Fail rate of replayed tasks above which analyze flags the tenant.
    pub fail_threshold: f64,
}

impl Default for ReplayBudget {
    fn default() -> Self {
        Self {
            max_batch: 50,
            max_payload_bytes: 2 * 1024 * 1024,
            per_tenant_per_day: 3,
            fail_threshold: 0.2,
        }
    }
}

/// Window of the per-tenant replay budget and of the replay stats.
pub fn budget_window() -> chrono::Duration {
    chrono::Duration::hours(24)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    pub tenant_id: TenantId,
    /// Specific items; `None` means every item of the tenant, oldest first.
    pub ids: Option<Vec<DlqItemId>>,
    pub max: Option<usize>,
}

impl ReplayRequest {
    pub fn all(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ids: None,
            max: None,
        }
    }

    pub fn ids(mut self, ids: Vec<DlqItemId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Pending,
    Quarantined,
    PayloadTooLarge,
    NotFound,
    DailyBudget,
    BatchLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub id: DlqItemId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCandidate {
    pub id: DlqItemId,
    pub source_task_id: TaskId,
    pub capability: String,
    pub attempts: u32,
    pub payload_bytes: u64,
}

/// The result of planning a replay; `dry_run` returns it as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPlan {
    pub tenant_id: TenantId,
    /// Effective batch limit after clamping to the budget.
    pub limit: usize,
    /// Replay runs of the tenant within the budget window.
    pub runs_today: usize,
    pub candidates: Vec<ReplayCandidate>,
    pub skipped: Vec<SkippedItem>,
}

impl ReplayPlan {
    pub fn would_replay(&self) -> usize {
        self.candidates.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayedItem {
    pub dlq_item_id: DlqItemId,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFailure {
    pub dlq_item_id: DlqItemId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub tenant_id: TenantId,
    pub replayed: Vec<ReplayedItem>,
    pub skipped: Vec<SkippedItem>,
    /// Set when the task store failed mid-batch. Items in `replayed` stay
    /// replayed; the failing item and the rest stay in the DLQ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ReplayFailure>,
}

impl ReplayReport {
    pub fn replayed_count(&self) -> usize {
        self.replayed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub tenant_id: TenantId,
    pub cancelled: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: usize,
}

/// Outcomes of tasks created by replays within the budget window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub runs: usize,
    pub replayed: usize,
    pub completed: usize,
    pub dead_lettered: usize,
    /// `dead_lettered / (completed + dead_lettered)`; `None` until one settles.
    pub fail_rate: Option<f64>,
    pub fail_threshold: f64,
    pub threshold_exceeded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqAnalysis {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_capability: BTreeMap<String, usize>,
    /// Most frequent errors first (ties by message).
    pub top_errors: Vec<ErrorCount>,
    pub oldest_created_at: Option<DateTime<Utc>>,
    pub total_payload_bytes: u64,
    pub replay: ReplayStats,
}

const TOP_ERRORS: usize = 5;

/// Decide which looked-up items a replay would take.
///
/// `lookups` is in request order: `Ok(item)` for found items, `Err(id)` for
/// ids that do not exist for the tenant. `runs_today` is the tenant's replay
/// runs within the budget window; once it reaches the daily budget nothing
/// is replayable.
pub fn plan_replay(
    tenant_id: TenantId,
    lookups: Vec<Result<DlqItem, DlqItemId>>,
    requested_max: Option<usize>,
    runs_today: usize,
    budget: ReplayBudget,
) -> ReplayPlan {
    let daily_exhausted = runs_today >= budget.per_tenant_per_day;
    let limit = requested_max
        .unwrap_or(budget.max_batch)
        .min(budget.max_batch);

    let mut candidates = Vec::new();
    let mut skipped = Vec::new();
    let mut seen = HashSet::new();

    for lookup in lookups {
        let item = match lookup {
            Ok(item) => item,
            Err(id) => {
                if seen.insert(id) {
                    skipped.push(SkippedItem {
                        id,
                        reason: SkipReason::NotFound,
                    });
                }
                continue;
            }
        };
        if !seen.insert(item.id) {
            continue;
        }

        let reason = if !item.status.is_replayable() {
            Some(match item.status {
                DlqStatus::Pending => SkipReason::Pending,
                _ => SkipReason::Quarantined,
            })
        } else if item.payload_bytes > budget.max_payload_bytes {
            Some(SkipReason::PayloadTooLarge)
        } else if daily_exhausted {
            Some(SkipReason::DailyBudget)
        } else if candidates.len() >= limit {
            Some(SkipReason::BatchLimit)
        } else {
            None
        };

        match reason {
            Some(reason) => skipped.push(SkippedItem {
                id: item.id,
                reason,
            }),
            None => candidates.push(ReplayCandidate {
                id: item.id,
                source_task_id: item.source_task_id,
                capability: item.capability.to_string(),
                attempts: item.attempts,
                payload_bytes: item.payload_bytes,
            }),
        }
    }

    ReplayPlan {
        tenant_id,
        limit,
        runs_today,
        candidates,
        skipped,
    }
}

pub struct DlqManager {
    tasks: Arc<dyn TaskStore>,
    dlq: Arc<dyn DlqStore>,
    breaker: Arc<CircuitBreaker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    budget: ReplayBudget,
}

impl DlqManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        dlq: Arc<dyn DlqStore>,
        breaker: Arc<CircuitBreaker>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        budget: ReplayBudget,
    ) -> Self {
        Self {
            tasks,
            dlq,
            breaker,
            ids,
            clock,
            events,
            budget,
        }
    }

    pub fn budget(&self) -> ReplayBudget {
        self.budget
    }

    pub async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, BobbinError> {
        self.dlq.list(filter).await
    }

    pub async fn get(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
    ) -> Result<DlqItem, BobbinError> {
        self.dlq
            .get(tenant_id, id)
            .await?
            .ok_or(BobbinError::DlqItemNotFound(id))
    }

    /// Simulate a replay. Never mutates.
    pub async fn dry_run(&self, request: &ReplayRequest) -> Result<ReplayPlan, BobbinError> {
        let lookups = match &request.ids {
            Some(ids) => {
                let mut lookups = Vec::with_capacity(ids.len());
                for &id in ids {
                    lookups.push(self.dlq.get(&request.tenant_id, id).await?.ok_or(id));
                }
                lookups
            }
            None => self
                .dlq
                .list(&DlqFilter::tenant(request.tenant_id.clone()))
                .await?
                .into_iter()
                .map(Ok)
                .collect(),
        };
        let since = self.clock.now() - budget_window();
        let runs_today = self
            .dlq
            .replay_runs(Some(&request.tenant_id), since)
            .await?
            .len();
        Ok(plan_replay(
            request.tenant_id.clone(),
            lookups,
            request.max,
            runs_today,
            self.budget,
        ))
    }

    /// Re-enqueue planned items as fresh queued tasks (attempts start at 0).
    pub async fn replay(
        &self,
        request: &ReplayRequest,
        actor: &str,
    ) -> Result<ReplayReport, BobbinError> {
        let plan = self.dry_run(request).await?;
        let tenant_id = plan.tenant_id.clone();
        let mut report = ReplayReport {
            tenant_id: tenant_id.clone(),
            replayed: Vec::with_capacity(plan.candidates.len()),
            skipped: plan.skipped,
            failure: None,
        };

        for candidate in plan.candidates {
            let Some(item) = self.dlq.take(&tenant_id, candidate.id).await? else {
                report.skipped.push(SkippedItem {
                    id: candidate.id,
                    reason: SkipReason::NotFound,
                });
                continue;
            };

            let task = TaskRecord::new(self.ids.task_id(), item.to_new_task(), self.clock.now());
            let task_id = task.id;
            if let Err(e) = self.tasks.insert(task).await {
                // item を戻してから中断する
                let dlq_item_id = item.id;
                if let Err(restore) = self.dlq.insert(item).await {
                    tracing::error!(
                        dlq_item_id = %dlq_item_id,
                        error = %restore,
                        "failed to restore dlq item after replay error"
                    );
                }
                report.failure = Some(ReplayFailure {
                    dlq_item_id,
                    error: e.to_string(),
                });
                break;
            }

            tracing::info!(
                tenant_id = %tenant_id,
                dlq_item_id = %item.id,
                task_id = %task_id,
                "dlq item replayed"
            );
            report.replayed.push(ReplayedItem {
                dlq_item_id: item.id,
                task_id,
            });
        }

        if !report.replayed.is_empty() {
            let run = ReplayRun {
                tenant_id: tenant_id.clone(),
                actor: actor.to_string(),
                at: self.clock.now(),
                task_ids: report.replayed.iter().map(|r| r.task_id).collect(),
            };
            if let Err(e) = self.dlq.record_replay(run).await {
                tracing::error!(tenant_id = %tenant_id, error = %e, "failed to record replay run");
            }
        }

        self.audit(
            AuditEvent::new(AuditAction::Replay, self.clock.now(), actor, "dlq replay")
                .tenant(tenant_id)
                .details(json!({
                    "replayed": report.replayed.len(),
                    "skipped": report.skipped.len(),
                    "failed": report.failure.is_some(),
                })),
        )
        .await;
        Ok(report)
    }

    pub async fn pause(
        &self,
        tenant_id: &TenantId,
        actor: &str,
        reason: &str,
    ) -> Result<(), BobbinError> {
        self.breaker
            .set_tenant_paused(tenant_id, true, actor, reason)
            .await
            .map(|_| ())
    }

    pub async fn unpause(
        &self,
        tenant_id: &TenantId,
        actor: &str,
        reason: &str,
    ) -> Result<(), BobbinError> {
        self.breaker
            .set_tenant_paused(tenant_id, false, actor, reason)
            .await
            .map(|_| ())
    }

    /// Cancel every non-terminal task of the tenant. Irreversible.
    pub async fn drain(
        &self,
        tenant_id: &TenantId,
        actor: &str,
        reason: &str,
    ) -> Result<DrainReport, BobbinError> {
        let cancelled = self
            .tasks
            .cancel_tenant(tenant_id, self.clock.now())
            .await?;
        tracing::warn!(tenant_id = %tenant_id, cancelled = cancelled.len(), "tenant drained");
        self.audit(
            AuditEvent::new(AuditAction::Drain, self.clock.now(), actor, reason)
                .tenant(tenant_id.clone())
                .details(json!({ "cancelled": cancelled.len() })),
        )
        .await;
        Ok(DrainReport {
            tenant_id: tenant_id.clone(),
            cancelled,
        })
    }

    /// Hold an item for manual review; replay skips it.
    pub async fn quarantine(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
        actor: &str,
        reason: &str,
    ) -> Result<DlqItem, BobbinError> {
        let current = self.get(tenant_id, id).await?;
        if current.status == DlqStatus::Pending {
            return Err(BobbinError::InvalidInput(format!(
                "{id} is still being dead-lettered"
            )));
        }
        let item = self
            .dlq
            .set_status(tenant_id, id, DlqStatus::Quarantined, None)
            .await?;
        self.audit(
            AuditEvent::new(AuditAction::Quarantine, self.clock.now(), actor, reason)
                .tenant(tenant_id.clone())
                .details(json!({ "dlq_item_id": id.to_string() })),
        )
        .await;
        Ok(item)
    }

    /// Quarantined -> ready, recording the reviewer.
    pub async fn release(
        &self,
        tenant_id: &TenantId,
        id: DlqItemId,
        reviewer: &str,
    ) -> Result<DlqItem, BobbinError> {
        let current = self.get(tenant_id, id).await?;
        if current.status != DlqStatus::Quarantined {
            return Err(BobbinError::InvalidInput(format!(
                "{id} is not quarantined"
            )));
        }
        let item = self
            .dlq
            .set_status(tenant_id, id, DlqStatus::Ready, Some(reviewer.to_string()))
            .await?;
        self.audit(
            AuditEvent::new(AuditAction::Release, self.clock.now(), reviewer, "reviewed")
                .tenant(tenant_id.clone())
                .details(json!({ "dlq_item_id": id.to_string() })),
        )
        .await;
        Ok(item)
    }

    /// Counts by status and capability plus the most frequent errors.
    pub async fn analyze(&self, tenant_id: Option<&TenantId>) -> Result<DlqAnalysis, BobbinError> {
        let filter = DlqFilter {
            tenant_id: tenant_id.cloned(),
            ..Default::default()
        };
        let items = self.dlq.list(&filter).await?;

        let mut by_status = BTreeMap::new();
        let mut by_capability = BTreeMap::new();
        let mut errors: BTreeMap<&str, usize> = BTreeMap::new();
        for item in &items {
            let status = serde_json::to_value(item.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_status.entry(status).or_insert(0) += 1;
            *by_capability
                .entry(item.capability.to_string())
                .or_insert(0) += 1;
            *errors.entry(item.last_error.as_str()).or_insert(0) += 1;
        }

        let mut top_errors: Vec<ErrorCount> = errors
            .into_iter()
            .map(|(message, count)| ErrorCount {
                message: message.to_string(),
                count,
            })
            .collect();
        // BTreeMap 由来でメッセージ順なので、安定ソートで同数はメッセージ順のまま
        top_errors.sort_by(|a, b| b.count.cmp(&a.count));
        top_errors.truncate(TOP_ERRORS);

        Ok(DlqAnalysis {
            total: items.len(),
            by_status,
            by_capability,
            top_errors,
            oldest_created_at: items.iter().map(|i| i.created_at).min(),
            total_payload_bytes: items.iter().map(|i| i.payload_bytes).sum(),
            replay: self.replay_stats(tenant_id).await?,
        })
    }

    /// How the tasks replayed within the budget window turned out.
    pub async fn replay_stats(
        &self,
        tenant_id: Option<&TenantId>,
    ) -> Result<ReplayStats, BobbinError> {
        let since = self.clock.now() - budget_window();
        let runs = self.dlq.replay_runs(tenant_id, since).await?;

        let mut replayed = 0;
        let mut completed = 0;
        let mut dead_lettered = 0;
        for task_id in runs.iter().flat_map(|r| &r.task_ids) {
            replayed += 1;
            match self.tasks.get(*task_id).await?.map(|t| t.status) {
                Some(TaskStatus::Completed) => completed += 1,
                Some(TaskStatus::DeadLettered) => dead_lettered += 1,
                _ => {}
            }
        }

        let settled = completed + dead_lettered;
        let fail_rate = (settled > 0).then(|| dead_lettered as f64 / settled as f64);
        let threshold_exceeded = fail_rate.is_some_and(|r| r > self.budget.fail_threshold);
        if threshold_exceeded {
            tracing::warn!(
                tenant_id = ?tenant_id,
                fail_rate = ?fail_rate,
                threshold = self.budget.fail_threshold,
                "replay fail rate above threshold"
            );
        }
        Ok(ReplayStats {
            runs: runs.len(),
            replayed,
            completed,
            dead_lettered,
            fail_rate,
            fail_threshold: self.budget.fail_threshold,
            threshold_exceeded,
        })
    }

    async fn audit(&self, event: AuditEvent) {
        let action = event.action.as_str();
        if let Err(e) = self.events.emit(event).await {
            tracing::error!(action, error = %e, "failed to record audit event");
        }
    }
}
