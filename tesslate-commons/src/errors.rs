//! Error taxonomy shared by the orchestrator, shell broker, and Git manager.
//!
//! Mirrors the error kinds from the source system's error taxonomy: each
//! variant names how its failure propagates (surfaced, retried, or
//! terminal), matching the table in the specification's error-handling
//! section.

use thiserror::Error;

/// Cross-cutting error kinds used by components that don't own a more
/// specific error enum. Components with richer surfaces (orchestrator,
/// shell manager, git manager) define their own `thiserror` enums and
/// convert into/out of this one at their boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("environment is not running: {0}")]
    EnvNotRunning(String),

    #[error("credentials missing for {0}")]
    CredentialMissing(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether this error kind is worth retrying with backoff (§7 `transient-io`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TransientIo(_))
    }
}

/// A user-facing failure envelope: a short message plus an optional
/// suggestion for what to do next. Every tool result and agent-stream
/// `error` event is rendered through this shape (§7 "User-visible failure
/// behavior").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserFacingError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl UserFacingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_retryable() {
        assert!(CoreError::TransientIo("timeout".into()).is_retryable());
        assert!(!CoreError::NotFound("x".into()).is_retryable());
    }
}
