//! Error types for infra-orchestrator operations.
//!
//! Defines error types for each subsystem:
//! - Remote task dispatch (transport and remote rejections)
//! - Parameter/response codecs
//! - Durable correlation and sweeping-output stores
//! - The orchestration taxonomy surfaced to the pipeline engine

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::migrations::MigrationError;

/// Lifecycle phase a remote task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Execute,
    Cleanup,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "Init",
            Phase::Execute => "Execute",
            Phase::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote operation a dispatch error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOperation {
    Submit,
    Cancel,
    Progress,
    RegisterCallback,
}

impl DispatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOperation::Submit => "submit",
            DispatchOperation::Cancel => "cancel",
            DispatchOperation::Progress => "progress",
            DispatchOperation::RegisterCallback => "register-callback",
        }
    }

    /// Message used when the remote side gave no status description.
    pub fn generic_message(&self) -> &'static str {
        match self {
            DispatchOperation::Submit => "Unexpected error occurred while submitting task.",
            DispatchOperation::Cancel => "Unexpected error occurred while cancelling task.",
            DispatchOperation::Progress => "Unexpected error occurred while fetching task progress.",
            DispatchOperation::RegisterCallback => {
                "Unexpected error occurred while registering callback."
            }
        }
    }
}

impl fmt::Display for DispatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the task dispatch client.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request never produced a remote answer (connect, deadline, I/O).
    #[error("{operation} transport failure: {description}")]
    Transport {
        operation: DispatchOperation,
        description: String,
    },

    /// The remote side answered with a non-success status.
    #[error("{operation} rejected ({code}): {description}")]
    Rejected {
        operation: DispatchOperation,
        code: u16,
        description: String,
    },

    /// The remote answer could not be parsed.
    #[error("Failed to parse {operation} response: {source}")]
    InvalidResponse {
        operation: DispatchOperation,
        #[source]
        source: serde_json::Error,
    },

    /// The HTTP client could not be constructed.
    #[error("Failed to build dispatch client: {0}")]
    ClientBuild(String),
}

impl DispatchError {
    /// Human readable reason, preferring the remote description.
    pub fn description(&self) -> String {
        match self {
            DispatchError::Transport { description, .. }
            | DispatchError::Rejected { description, .. } => description.clone(),
            DispatchError::InvalidResponse { operation, .. } => {
                operation.generic_message().to_string()
            }
            DispatchError::ClientBuild(message) => message.clone(),
        }
    }
}

/// Errors raised while encoding or decoding task parameters and responses.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary codec error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown codec format tag {0}")]
    UnknownFormat(u8),

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Errors raised by the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Orchestration errors surfaced to the pipeline engine.
///
/// Every variant that concerns a remote task names the phase it happened in.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// RPC/network failure reaching the submission API.
    #[error("{phase} failed: {}", .source.description())]
    RemoteTransport {
        phase: Phase,
        #[source]
        source: DispatchError,
    },

    /// The remote side accepted the Init task but reported failure.
    #[error(
        "Init failed (task {task_id}, infra {}): {message}",
        .infra_ref_id.as_deref().unwrap_or("<unassigned>")
    )]
    InfraInitialization {
        task_id: String,
        infra_ref_id: Option<String>,
        message: String,
    },

    /// A sibling task failed and the remaining tasks were cancelled.
    #[error("Execute failed for step {step_id}: task {task_id} failed: {reason}")]
    SiblingTaskFailure {
        step_id: String,
        task_id: String,
        reason: String,
    },

    /// A single-task step, or a step without an execution result, failed.
    #[error("{phase} failed for step {step_id}: {message}")]
    StepFailed {
        step_id: String,
        phase: Phase,
        message: String,
    },

    /// The step was aborted from outside.
    #[error("Step {step_id} aborted: {reason}")]
    AbortRequested { step_id: String, reason: String },

    /// Parameters or responses could not be encoded/decoded; no remote call was made.
    #[error("{phase} failed: serialization error: {source}")]
    Serialization {
        phase: Phase,
        #[source]
        source: CodecError,
    },

    /// No infra output has been recorded for the stage yet.
    #[error("Execute failed: no infrastructure output recorded for stage {stage_execution_id}")]
    InfraNotFound { stage_execution_id: String },

    /// A delivered callback id has no correlation entry.
    #[error("Unknown callback id: {0}")]
    UnknownCallback(String),

    /// The step definition is not dispatchable.
    #[error("Invalid step: {0}")]
    InvalidStep(String),

    /// A callback carried a response shape the owning phase cannot handle.
    #[error("{phase} failed: unexpected response for callback {callback_id}: {detail}")]
    UnexpectedResponse {
        phase: Phase,
        callback_id: String,
        detail: String,
    },

    /// The step has not produced an outcome yet.
    #[error("Outcome for step {0} is not ready")]
    OutcomeNotReady(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Phase the error is attributed to, when it concerns a remote task.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            OrchestratorError::RemoteTransport { phase, .. }
            | OrchestratorError::Serialization { phase, .. }
            | OrchestratorError::UnexpectedResponse { phase, .. }
            | OrchestratorError::StepFailed { phase, .. } => Some(*phase),
            OrchestratorError::InfraInitialization { .. } => Some(Phase::Init),
            OrchestratorError::SiblingTaskFailure { .. }
            | OrchestratorError::InfraNotFound { .. } => Some(Phase::Execute),
            _ => None,
        }
    }

    pub(crate) fn transport(phase: Phase) -> impl FnOnce(DispatchError) -> Self {
        move |source| OrchestratorError::RemoteTransport { phase, source }
    }

    pub(crate) fn serialization(phase: Phase) -> impl FnOnce(CodecError) -> Self {
        move |source| OrchestratorError::Serialization { phase, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_transport_names_phase_and_description() {
        let err = OrchestratorError::RemoteTransport {
            phase: Phase::Execute,
            source: DispatchError::Rejected {
                operation: DispatchOperation::Submit,
                code: 503,
                description: "no eligible delegates".to_string(),
            },
        };
        let message = err.to_string();
        assert!(message.starts_with("Execute failed"));
        assert!(message.contains("no eligible delegates"));
        assert_eq!(err.phase(), Some(Phase::Execute));
    }

    #[test]
    fn test_infra_initialization_display() {
        let err = OrchestratorError::InfraInitialization {
            task_id: "task-7".to_string(),
            infra_ref_id: None,
            message: "quota exceeded".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("Init failed"));
        assert!(message.contains("quota exceeded"));
        assert!(message.contains("<unassigned>"));

        let err = OrchestratorError::InfraInitialization {
            task_id: "task-7".to_string(),
            infra_ref_id: Some("infra-9".to_string()),
            message: "image pull backoff".to_string(),
        };
        assert!(err.to_string().contains("infra-9"));
    }

    #[test]
    fn test_dispatch_error_description_falls_back_to_generic() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = DispatchError::InvalidResponse {
            operation: DispatchOperation::Submit,
            source,
        };
        assert_eq!(
            err.description(),
            "Unexpected error occurred while submitting task."
        );
    }

    #[test]
    fn test_step_failed_names_phase() {
        let err = OrchestratorError::StepFailed {
            step_id: "build".to_string(),
            phase: Phase::Execute,
            message: "exit code 1".to_string(),
        };
        assert_eq!(err.to_string(), "Execute failed for step build: exit code 1");
        assert_eq!(err.phase(), Some(Phase::Execute));

        let err = OrchestratorError::AbortRequested {
            step_id: "build".to_string(),
            reason: "Step aborted".to_string(),
        };
        assert_eq!(err.phase(), None);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Init.to_string(), "Init");
        assert_eq!(Phase::Cleanup.to_string(), "Cleanup");
    }

    #[test]
    fn test_codec_error_display() {
        assert!(CodecError::UnsupportedVersion(9).to_string().contains('9'));
        assert!(CodecError::UnknownFormat(4).to_string().contains("format"));
    }
}
