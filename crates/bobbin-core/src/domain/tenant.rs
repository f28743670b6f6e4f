use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::BobbinError;

/// Tenant identifier.
///
/// Admin actions are always scoped by tenant, so an empty or blank id is
/// rejected at construction instead of being read as "all tenants".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(s: impl Into<String>) -> Result<Self, BobbinError> {
        let s = s.into();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(BobbinError::TenantRequired);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(BobbinError::InvalidInput(format!(
                "tenant_id must not contain whitespace: '{trimmed}'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Optional input from a request boundary; `None` is rejected.
    pub fn require(s: Option<&str>) -> Result<Self, BobbinError> {
        match s {
            Some(s) => Self::parse(s),
            None => Err(BobbinError::TenantRequired),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = BobbinError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
