// src/utils/errors.rs
//! Error types for the orchestrator
//!
//! A single error enum covers every failure the control plane can surface.
//! Submission-time errors are returned to the caller; errors inside a run's
//! supervisor are converted into terminal events instead.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed submission, unknown profile, unknown runner kind, or a
    /// reused idempotency key with a different fingerprint
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Admission cap reached; the caller should retry later
    #[error("at capacity: {max} concurrent runs")]
    AtCapacity { max: usize },

    /// Entity lookup failed
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Runner adapter reported itself unavailable
    #[error("runner {kind} unavailable: {reason}")]
    RunnerUnavailable { kind: String, reason: String },

    /// Runner launch failed
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// Storage error worth retrying (busy database, lock contention)
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    /// Storage error that retrying will not fix
    #[error("storage failed: {0}")]
    StorageFailed(String),

    /// Append attempted after the run's terminal event
    #[error("event log for run {0} is sealed")]
    EventLogSealed(String),

    /// Sandbox filesystem operation failed; may succeed on retry
    #[error("sandbox failed: {0}")]
    SandboxFailed(String),

    /// Sandbox acquired twice or released twice for one run
    #[error("sandbox conflict: {0}")]
    SandboxConflict(String),

    /// Terminator exhausted every escalation step
    #[error("termination failed for run {run_id}: {reason}")]
    TerminationFailed { run_id: String, reason: String },

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON/YAML (de)serialization failed
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientStorage(_) | OrchestratorError::SandboxFailed(_)
        )
    }

    /// Short machine-readable label, used for metrics and event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidInput(_) => "invalid_input",
            OrchestratorError::AtCapacity { .. } => "at_capacity",
            OrchestratorError::NotFound { .. } => "not_found",
            OrchestratorError::RunnerUnavailable { .. } => "runner_unavailable",
            OrchestratorError::LaunchFailed(_) => "launch_failed",
            OrchestratorError::TransientStorage(_) => "transient_storage",
            OrchestratorError::StorageFailed(_) => "storage_failed",
            OrchestratorError::EventLogSealed(_) => "event_log_sealed",
            OrchestratorError::SandboxFailed(_) => "sandbox_failed",
            OrchestratorError::SandboxConflict(_) => "sandbox_conflict",
            OrchestratorError::TerminationFailed { .. } => "termination_failed",
            OrchestratorError::ConfigError(_) => "config_error",
            OrchestratorError::SerializationFailed(_) => "serialization_failed",
            OrchestratorError::Io(_) => "io",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        OrchestratorError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::SerializationFailed(e.to_string())
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                OrchestratorError::TransientStorage(e.to_string())
            }
            _ => OrchestratorError::StorageFailed(e.to_string()),
        }
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(e: config::ConfigError) -> Self {
        OrchestratorError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(OrchestratorError::TransientStorage("busy".into()).is_transient());
        assert!(OrchestratorError::SandboxFailed("eagain".into()).is_transient());
        assert!(!OrchestratorError::SandboxConflict("released twice".into()).is_transient());
        assert!(!OrchestratorError::InvalidInput("bad".into()).is_transient());
        assert!(!OrchestratorError::AtCapacity { max: 2 }.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::AtCapacity { max: 10 };
        assert_eq!(err.to_string(), "at capacity: 10 concurrent runs");
        assert_eq!(err.kind(), "at_capacity");

        let err = OrchestratorError::not_found("run", "run_1");
        assert_eq!(err.to_string(), "run not found: run_1");
    }
}
