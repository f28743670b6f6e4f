//! Health posture (derived, never persisted as source of truth).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Overall {
    Green,
    Yellow,
    Red,
}

impl fmt::Display for Overall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Overall::Green => f.write_str("GREEN"),
            Overall::Yellow => f.write_str("YELLOW"),
            Overall::Red => f.write_str("RED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Warn,
    Fail,
}

/// One check in the posture: a status plus the observed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub status: CheckStatus,
    pub detail: serde_json::Value,
}

impl Check {
    pub fn new(status: CheckStatus, detail: serde_json::Value) -> Self {
        Self { status, detail }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checks {
    pub flags: Check,
    pub agents: Check,
    pub database: Check,
    pub metrics: Check,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPosture {
    pub timestamp: DateTime<Utc>,
    pub overall: Overall,
    pub checks: Checks,
    pub recommendations: Vec<String>,
}
