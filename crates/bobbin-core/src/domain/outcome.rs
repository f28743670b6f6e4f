//! Outcome model: what one execution of a handler produced.
//!
//! The claim manager turns an `Outcome` into a task transition
//! (complete / retry / dead-letter). Handlers never see tasks or leases.

use serde::{Deserialize, Serialize};

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Retrying may help (network blip, timeout, panic, ...).
    Transient,
    /// Retrying cannot help (unknown capability, malformed payload, ...).
    Permanent,
}

/// Error returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HandlerError {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FailureKind::Permanent
    }
}

/// Result of one execution, as reported to the claim manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Failure {
        error: HandlerError,
    },
}

impl Outcome {
    pub fn success() -> Self {
        Outcome::Success { result: None }
    }

    pub fn success_with(result: serde_json::Value) -> Self {
        Outcome::Success {
            result: Some(result),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Outcome::Failure {
            error: HandlerError::transient(message),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Outcome::Failure {
            error: HandlerError::permanent(message),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl From<Result<serde_json::Value, HandlerError>> for Outcome {
    fn from(value: Result<serde_json::Value, HandlerError>) -> Self {
        match value {
            Ok(serde_json::Value::Null) => Outcome::success(),
            Ok(v) => Outcome::success_with(v),
            Err(error) => Outcome::Failure { error },
        }
    }
}
