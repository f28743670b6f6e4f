//! Audit events recorded by operator actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EmergencyStop,
    Resume,
    Pause,
    Unpause,
    Drain,
    Replay,
    Quarantine,
    Release,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::EmergencyStop => "emergency_stop",
            AuditAction::Resume => "resume",
            AuditAction::Pause => "pause",
            AuditAction::Unpause => "unpause",
            AuditAction::Drain => "drain",
            AuditAction::Replay => "replay",
            AuditAction::Quarantine => "quarantine",
            AuditAction::Release => "release",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub reason: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        timestamp: DateTime<Utc>,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action,
            timestamp,
            actor: actor.into(),
            tenant_id: None,
            reason: reason.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
