//! Feature flags: (key, scope, environment) -> one active value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::tenant::TenantId;

/// Flag keys read by the runtime.
pub mod keys {
    /// Global kill switch. Missing means stopped.
    pub const EMERGENCY_STOP: &str = "autonomy.emergencyStop";
    /// Operating mode (`FULL` | `PARTIAL` | `MINIMAL`).
    pub const OPERATING_MODE: &str = "autonomy.mode";
    /// Capability-area switch for autonomous workers.
    pub const AGENTS_ENABLED: &str = "agents.autonomousEnabled";
    /// Observability export switch.
    pub const OBSERVABILITY_ENABLED: &str = "obs.otelEnabled";
    /// Tenant-scoped pause.
    pub const TENANT_PAUSED: &str = "tenant.paused";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tenant_id", rename_all = "snake_case")]
pub enum FlagScope {
    Global,
    Tenant(TenantId),
}

impl FlagScope {
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            FlagScope::Global => None,
            FlagScope::Tenant(t) => Some(t),
        }
    }
}

impl fmt::Display for FlagScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagScope::Global => f.write_str("global"),
            FlagScope::Tenant(t) => write!(f, "tenant:{t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub scope: FlagScope,
    pub environment: String,
    pub value: serde_json::Value,
    /// Free-form metadata.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub reason: String,
    pub owner: String,
    /// Bumped on every write to the same (key, scope, environment).
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// A write request; the store fills in `version` and `updated_at`.
#[derive(Debug, Clone)]
pub struct FlagUpdate {
    pub key: String,
    pub scope: FlagScope,
    pub environment: String,
    pub value: serde_json::Value,
    pub payload: serde_json::Value,
    pub reason: String,
    pub owner: String,
}

impl FlagUpdate {
    pub fn new(
        key: impl Into<String>,
        scope: FlagScope,
        environment: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            scope,
            environment: environment.into(),
            value,
            payload: serde_json::Value::Null,
            reason: String::new(),
            owner: String::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Operating mode. Anything other than `Full` degrades posture to YELLOW.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Full,
    Partial,
    Minimal,
    Other(String),
}

impl OperatingMode {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => OperatingMode::Full,
            "PARTIAL" => OperatingMode::Partial,
            "MINIMAL" => OperatingMode::Minimal,
            _ => OperatingMode::Other(s.to_string()),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, OperatingMode::Full)
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Full => f.write_str("FULL"),
            OperatingMode::Partial => f.write_str("PARTIAL"),
            OperatingMode::Minimal => f.write_str("MINIMAL"),
            OperatingMode::Other(s) => f.write_str(s),
        }
    }
}
