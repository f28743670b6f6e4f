use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability name: the key a task uses to find its handler in the
/// function registry.
///
/// 命名規約は `{domain}.{action}` または `{domain}.{action}.v{major}`
/// （例: `billing.invoice.generate.v1`）。規約は強制しない。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
