//! AdminControlPlane - 運用コマンドの薄い表面
//!
//! - 変更系のコマンドはすべて `AdminResult` を返す（失敗も構造化して返す）
//! - DLQ 系は `DlqRequest` → `DlqResponse` の JSON 境界も持つ
//! - tenant を取るコマンドは tenant 無しを拒否する

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::breaker::CircuitBreaker;
use super::dlq::{DlqManager, ReplayRequest};
use super::posture::HealthAggregator;
use crate::domain::{BobbinError, DlqItemId, HealthPosture, TenantId};
use crate::ports::Clock;

/// Human message plus structured details of a successful command.
type Summary = Result<(String, serde_json::Value), BobbinError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResult {
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqAction {
    Pause,
    Unpause,
    Drain,
    DryRun,
    Replay,
}

impl DlqAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DlqAction::Pause => "pause",
            DlqAction::Unpause => "unpause",
            DlqAction::Drain => "drain",
            DlqAction::DryRun => "dry_run",
            DlqAction::Replay => "replay",
        }
    }
}

/// `{action, tenant_id, ids?, max?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRequest {
    pub action: DlqAction,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `{ok, error?, ...action fields}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqResponse {
    pub ok: bool,
    pub action: DlqAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl DlqResponse {
    fn ok(action: DlqAction, fields: serde_json::Value) -> Self {
        let fields = match fields {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            ok: true,
            action,
            error: None,
            fields,
        }
    }

    fn err(action: DlqAction, error: &BobbinError) -> Self {
        Self {
            ok: false,
            action,
            error: Some(error.to_string()),
            fields: serde_json::Map::new(),
        }
    }

    /// Failed, but part of the action already took effect; `fields` says which part.
    fn partial(action: DlqAction, error: String, fields: serde_json::Value) -> Self {
        Self {
            ok: false,
            error: Some(error),
            ..Self::ok(action, fields)
        }
    }
}

pub struct AdminControlPlane {
    breaker: Arc<CircuitBreaker>,
    dlq: Arc<DlqManager>,
    health: Arc<HealthAggregator>,
    clock: Arc<dyn Clock>,
    actor: String,
}

impl AdminControlPlane {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        dlq: Arc<DlqManager>,
        health: Arc<HealthAggregator>,
        clock: Arc<dyn Clock>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            breaker,
            dlq,
            health,
            clock,
            actor: actor.into(),
        }
    }

    pub fn dlq(&self) -> &DlqManager {
        &self.dlq
    }

    /// Read-only.
    pub async fn status(&self) -> HealthPosture {
        self.health.compute().await
    }

    pub async fn stop(&self, reason: &str) -> AdminResult {
        let result = self
            .breaker
            .set_emergency_stop(true, &self.actor, reason)
            .await;
        self.finish("stop", result.map(|flag| {
            (
                "emergency stop activated; no new tasks will be claimed".to_string(),
                json!({ "reason": reason, "version": flag.version }),
            )
        }))
    }

    pub async fn resume(&self, reason: &str) -> AdminResult {
        let result = self
            .breaker
            .set_emergency_stop(false, &self.actor, reason)
            .await;
        self.finish("resume", result.map(|flag| {
            (
                "emergency stop cleared; claiming resumes on the next poll".to_string(),
                json!({ "reason": reason, "version": flag.version }),
            )
        }))
    }

    pub async fn pause(&self, tenant_id: Option<&str>, reason: &str) -> AdminResult {
        let result: Summary = async {
            let tenant = TenantId::require(tenant_id)?;
            self.dlq.pause(&tenant, &self.actor, reason).await?;
            Ok((
                format!("tenant {tenant} paused"),
                json!({ "tenant_id": tenant }),
            ))
        }
        .await;
        self.finish("pause", result)
    }

    pub async fn unpause(&self, tenant_id: Option<&str>, reason: &str) -> AdminResult {
        let result: Summary = async {
            let tenant = TenantId::require(tenant_id)?;
            self.dlq.unpause(&tenant, &self.actor, reason).await?;
            Ok((
                format!("tenant {tenant} unpaused"),
                json!({ "tenant_id": tenant }),
            ))
        }
        .await;
        self.finish("unpause", result)
    }

    pub async fn drain(&self, tenant_id: Option<&str>, reason: &str) -> AdminResult {
        let result: Summary = async {
            let tenant = TenantId::require(tenant_id)?;
            let report = self.dlq.drain(&tenant, &self.actor, reason).await?;
            Ok((
                format!(
                    "tenant {tenant} drained; {} task(s) cancelled",
                    report.cancelled.len()
                ),
                serde_json::to_value(&report).unwrap_or_default(),
            ))
        }
        .await;
        self.finish("drain", result)
    }

    pub async fn dry_run(
        &self,
        tenant_id: Option<&str>,
        ids: Option<&[String]>,
        max: Option<usize>,
    ) -> AdminResult {
        let result: Summary = async {
            let request = replay_request(tenant_id, ids, max)?;
            let plan = self.dlq.dry_run(&request).await?;
            Ok((
                format!(
                    "dry run: {} item(s) would be replayed, {} skipped",
                    plan.would_replay(),
                    plan.skipped.len()
                ),
                serde_json::to_value(&plan).unwrap_or_default(),
            ))
        }
        .await;
        self.finish("dry_run", result)
    }

    pub async fn replay(
        &self,
        tenant_id: Option<&str>,
        ids: Option<&[String]>,
        max: Option<usize>,
    ) -> AdminResult {
        let action = "replay";
        let result = async {
            let request = replay_request(tenant_id, ids, max)?;
            self.dlq.replay(&request, &self.actor).await
        }
        .await;
        match result {
            Ok(report) => {
                let details = serde_json::to_value(&report).unwrap_or_default();
                match &report.failure {
                    None => self.result(
                        action,
                        true,
                        format!(
                            "replayed {} item(s), {} skipped",
                            report.replayed_count(),
                            report.skipped.len()
                        ),
                        details,
                    ),
                    Some(failure) => self.result(
                        action,
                        false,
                        format!(
                            "replay stopped after {} item(s): {}",
                            report.replayed_count(),
                            failure.error
                        ),
                        details,
                    ),
                }
            }
            Err(e) => self.failed(action, &e),
        }
    }

    pub async fn quarantine(
        &self,
        tenant_id: Option<&str>,
        id: &str,
        reason: &str,
    ) -> AdminResult {
        let result: Summary = async {
            let tenant = TenantId::require(tenant_id)?;
            let id: DlqItemId = id.parse()?;
            let item = self.dlq.quarantine(&tenant, id, &self.actor, reason).await?;
            Ok((
                format!("{id} quarantined"),
                serde_json::to_value(&item).unwrap_or_default(),
            ))
        }
        .await;
        self.finish("quarantine", result)
    }

    pub async fn release(&self, tenant_id: Option<&str>, id: &str) -> AdminResult {
        let result: Summary = async {
            let tenant = TenantId::require(tenant_id)?;
            let id: DlqItemId = id.parse()?;
            let item = self.dlq.release(&tenant, id, &self.actor).await?;
            Ok((
                format!("{id} released for replay"),
                serde_json::to_value(&item).unwrap_or_default(),
            ))
        }
        .await;
        self.finish("release", result)
    }

    /// JSON request boundary for the DLQ commands.
    pub async fn handle_dlq(&self, request: DlqRequest) -> DlqResponse {
        let action = request.action;
        let reason = request.reason.as_deref().unwrap_or("");
        let tenant = request.tenant_id.as_deref();
        let ids = request.ids.as_deref();

        let result: Result<DlqResponse, BobbinError> = async {
            let fields = match action {
                DlqAction::Pause => {
                    let tenant = TenantId::require(tenant)?;
                    self.dlq.pause(&tenant, &self.actor, reason).await?;
                    json!({ "tenant_id": tenant, "paused": true })
                }
                DlqAction::Unpause => {
                    let tenant = TenantId::require(tenant)?;
                    self.dlq.unpause(&tenant, &self.actor, reason).await?;
                    json!({ "tenant_id": tenant, "paused": false })
                }
                DlqAction::Drain => {
                    let tenant = TenantId::require(tenant)?;
                    let report = self.dlq.drain(&tenant, &self.actor, reason).await?;
                    json!({
                        "tenant_id": report.tenant_id,
                        "cancelled": report.cancelled.len(),
                        "task_ids": report.cancelled,
                    })
                }
                DlqAction::DryRun => {
                    let plan = self
                        .dlq
                        .dry_run(&replay_request(tenant, ids, request.max)?)
                        .await?;
                    json!({
                        "tenant_id": plan.tenant_id,
                        "would_replay": plan.would_replay(),
                        "limit": plan.limit,
                        "runs_today": plan.runs_today,
                        "candidates": plan.candidates,
                        "skipped": plan.skipped,
                    })
                }
                DlqAction::Replay => {
                    let report = self
                        .dlq
                        .replay(&replay_request(tenant, ids, request.max)?, &self.actor)
                        .await?;
                    let fields = json!({
                        "tenant_id": report.tenant_id,
                        "replayed": report.replayed_count(),
                        "items": report.replayed,
                        "skipped": report.skipped,
                        "failure": report.failure,
                    });
                    if let Some(failure) = &report.failure {
                        let error = format!(
                            "replay stopped after {} item(s) at {}: {}",
                            report.replayed_count(),
                            failure.dlq_item_id,
                            failure.error
                        );
                        tracing::warn!(action = action.as_str(), error = %error, "dlq request partially applied");
                        return Ok(DlqResponse::partial(action, error, fields));
                    }
                    fields
                }
            };
            Ok(DlqResponse::ok(action, fields))
        }
        .await;

        result.unwrap_or_else(|e| {
            tracing::warn!(action = action.as_str(), error = %e, "dlq request failed");
            DlqResponse::err(action, &e)
        })
    }

    fn finish(&self, action: &str, result: Summary) -> AdminResult {
        match result {
            Ok((message, details)) => self.result(action, true, message, details),
            Err(e) => self.failed(action, &e),
        }
    }

    fn failed(&self, action: &str, error: &BobbinError) -> AdminResult {
        tracing::warn!(action, error = %error, "admin command failed");
        self.result(
            action,
            false,
            error.to_string(),
            json!({ "error_kind": format!("{:?}", error.kind()) }),
        )
    }

    fn result(
        &self,
        action: &str,
        success: bool,
        message: String,
        details: serde_json::Value,
    ) -> AdminResult {
        AdminResult {
            action: action.to_string(),
            timestamp: self.clock.now(),
            success,
            message,
            details,
        }
    }
}

fn replay_request(
    tenant_id: Option<&str>,
    ids: Option<&[String]>,
    max: Option<usize>,
) -> Result<ReplayRequest, BobbinError> {
    let tenant_id = TenantId::require(tenant_id)?;
    let ids = ids
        .map(|ids| {
            ids.iter()
                .map(|s| s.parse::<DlqItemId>())
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;
    Ok(ReplayRequest {
        tenant_id,
        ids,
        max,
    })
}
