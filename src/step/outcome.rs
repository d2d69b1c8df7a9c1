//! Task responses, task outcomes and step outcomes.
//!
//! Delegates answer every task with a [`TaskResponse`]. Each response reduces
//! to a [`TaskOutcome`], which drives the sibling-abort decision, and once all
//! tasks of a step have resolved their resolutions reduce to one
//! [`StepOutcome`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Phase};
use crate::store::types::Resolution;

/// Reason recorded on siblings cancelled because another task failed.
pub const SIBLING_ABORT_MESSAGE: &str = "Delegate is not able to connect to created build farm";

/// Reason recorded on tasks cancelled by an external abort.
pub const ABORT_MESSAGE: &str = "Step aborted";

/// Terminal result of one remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success(BTreeMap<String, String>),
    Failure(String),
    Cancelled(String),
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Success(_) => "success",
            TaskOutcome::Failure(_) => "failure",
            TaskOutcome::Cancelled(_) => "cancelled",
        }
    }
}

/// Execution status reported by a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandExecutionStatus {
    Success,
    Failure,
    Running,
    Queued,
    Skipped,
    Aborted,
}

/// Result of an Init task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitInfraResult {
    pub status: CommandExecutionStatus,
    pub infra_ref_id: Option<String>,
    pub error_message: Option<String>,
}

impl InitInfraResult {
    pub fn success(infra_ref_id: impl Into<String>) -> Self {
        Self {
            status: CommandExecutionStatus::Success,
            infra_ref_id: Some(infra_ref_id.into()),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: CommandExecutionStatus::Failure,
            infra_ref_id: None,
            error_message: Some(message.into()),
        }
    }
}

/// Result of a step execution, carrying the step's exported variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub status: CommandExecutionStatus,
    pub output_vars: BTreeMap<String, String>,
    pub error_message: Option<String>,
}

/// Decoded callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResponse {
    InitInfra(InitInfraResult),
    /// Authoritative execution result of a step.
    StepExecution(StepExecutionResult),
    /// Status of the lite-engine / build farm task, without step results.
    EngineStatus {
        status: CommandExecutionStatus,
        error_message: Option<String>,
    },
    Acknowledged,
    ErrorNotify {
        message: String,
    },
}

impl TaskResponse {
    pub fn outcome(&self) -> TaskOutcome {
        match self {
            TaskResponse::InitInfra(result) => {
                status_outcome(result.status, result.error_message.as_deref(), BTreeMap::new())
            }
            TaskResponse::StepExecution(result) => status_outcome(
                result.status,
                result.error_message.as_deref(),
                result.output_vars.clone(),
            ),
            TaskResponse::EngineStatus {
                status,
                error_message,
            } => status_outcome(*status, error_message.as_deref(), BTreeMap::new()),
            TaskResponse::Acknowledged => TaskOutcome::Success(BTreeMap::new()),
            TaskResponse::ErrorNotify { message } => TaskOutcome::Failure(message.clone()),
        }
    }

    pub fn execution_status(&self) -> Option<CommandExecutionStatus> {
        match self {
            TaskResponse::InitInfra(result) => Some(result.status),
            TaskResponse::StepExecution(result) => Some(result.status),
            TaskResponse::EngineStatus { status, .. } => Some(*status),
            TaskResponse::Acknowledged | TaskResponse::ErrorNotify { .. } => None,
        }
    }

    pub fn carries_execution_result(&self) -> bool {
        matches!(self, TaskResponse::StepExecution(_))
    }

    /// The Init result this response stands for; a delegate error fails Init.
    pub fn into_init_result(self) -> Result<InitInfraResult, TaskResponse> {
        match self {
            TaskResponse::InitInfra(result) => Ok(result),
            TaskResponse::ErrorNotify { message } => Ok(InitInfraResult::failure(message)),
            other => Err(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskResponse::InitInfra(_) => "init_infra",
            TaskResponse::StepExecution(_) => "step_execution",
            TaskResponse::EngineStatus { .. } => "engine_status",
            TaskResponse::Acknowledged => "acknowledged",
            TaskResponse::ErrorNotify { .. } => "error_notify",
        }
    }
}

fn status_outcome(
    status: CommandExecutionStatus,
    error_message: Option<&str>,
    output_vars: BTreeMap<String, String>,
) -> TaskOutcome {
    let reason = |fallback: &str| match error_message.filter(|m| !m.trim().is_empty()) {
        Some(message) => message.to_string(),
        None => fallback.to_string(),
    };

    match status {
        CommandExecutionStatus::Success => TaskOutcome::Success(output_vars),
        CommandExecutionStatus::Failure => TaskOutcome::Failure(reason("task reported FAILURE")),
        CommandExecutionStatus::Skipped => TaskOutcome::Failure(reason("task was skipped")),
        CommandExecutionStatus::Aborted => TaskOutcome::Cancelled(reason("task was aborted")),
        CommandExecutionStatus::Running | CommandExecutionStatus::Queued => TaskOutcome::Failure(
            format!("task reported non-terminal status {:?}", status),
        ),
    }
}

/// Decides which task outcomes cancel the remaining sibling tasks.
#[derive(Clone)]
pub struct SiblingAbortPolicy {
    predicate: Arc<dyn Fn(&TaskOutcome) -> bool + Send + Sync>,
}

impl SiblingAbortPolicy {
    /// Abort siblings on any failure. This is the default.
    pub fn on_failure() -> Self {
        Self::custom(|outcome| matches!(outcome, TaskOutcome::Failure(_)))
    }

    /// Abort siblings on failures and on remote cancellations.
    pub fn on_failure_or_cancel() -> Self {
        Self::custom(|outcome| !matches!(outcome, TaskOutcome::Success(_)))
    }

    /// Never abort siblings; every task runs to completion.
    pub fn never() -> Self {
        Self::custom(|_| false)
    }

    pub fn custom(predicate: impl Fn(&TaskOutcome) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    pub fn should_abort_siblings(&self, outcome: &TaskOutcome) -> bool {
        (self.predicate)(outcome)
    }
}

impl Default for SiblingAbortPolicy {
    fn default() -> Self {
        Self::on_failure()
    }
}

impl fmt::Debug for SiblingAbortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiblingAbortPolicy").finish_non_exhaustive()
    }
}

/// Final status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub phase: Phase,
    pub message: String,
    pub task_id: Option<String>,
    pub infra_ref_id: Option<String>,
    /// The failing task had siblings, which were cancelled.
    #[serde(default)]
    pub multi_task: bool,
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.message)?;
        if let Some(task_id) = &self.task_id {
            write!(f, " (task {})", task_id)?;
        }
        if let Some(infra_ref_id) = &self.infra_ref_id {
            write!(f, " (infra {})", infra_ref_id)?;
        }
        Ok(())
    }
}

/// The single outcome a step produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: Status,
    pub output_variables: BTreeMap<String, String>,
    pub failure: Option<FailureInfo>,
    pub completed_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn succeeded(step_id: impl Into<String>, output_variables: BTreeMap<String, String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: Status::Succeeded,
            output_variables,
            failure: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(step_id: impl Into<String>, failure: FailureInfo) -> Self {
        Self::unsuccessful(step_id, Status::Failed, failure)
    }

    pub fn skipped(step_id: impl Into<String>, failure: FailureInfo) -> Self {
        Self::unsuccessful(step_id, Status::Skipped, failure)
    }

    pub fn aborted(step_id: impl Into<String>, failure: FailureInfo) -> Self {
        Self::unsuccessful(step_id, Status::Aborted, failure)
    }

    fn unsuccessful(step_id: impl Into<String>, status: Status, failure: FailureInfo) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output_variables: BTreeMap::new(),
            failure: Some(failure),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Succeeded
    }

    /// Maps an unsuccessful outcome to the error the pipeline engine sees.
    /// Skipped steps are not errors.
    pub fn into_result(self) -> Result<StepOutcome, OrchestratorError> {
        if matches!(self.status, Status::Succeeded | Status::Skipped) {
            return Ok(self);
        }
        let Some(failure) = self.failure.clone() else {
            return Ok(self);
        };

        Err(match self.status {
            Status::Aborted => OrchestratorError::AbortRequested {
                step_id: self.step_id,
                reason: failure.message,
            },
            _ if failure.phase == Phase::Init => OrchestratorError::InfraInitialization {
                task_id: failure.task_id.unwrap_or_default(),
                infra_ref_id: failure.infra_ref_id,
                message: failure.message,
            },
            _ if failure.multi_task => OrchestratorError::SiblingTaskFailure {
                step_id: self.step_id,
                task_id: failure.task_id.unwrap_or_default(),
                reason: failure.message,
            },
            _ => OrchestratorError::StepFailed {
                step_id: self.step_id,
                phase: failure.phase,
                message: failure.message,
            },
        })
    }
}

/// Reduces the resolutions of every task of a step to its outcome.
///
/// A skipped execution result skips the step. Otherwise a real (non-synthetic)
/// failure of any task fails the step, even when a sibling carried a
/// successful result. Without one the non-synthetic execution result wins, a
/// cancellation aborts the step, and anything else is reported as a missing
/// result.
pub fn derive_outcome(step_id: &str, resolutions: &[(String, Resolution)]) -> StepOutcome {
    let multi_task = resolutions.len() > 1;
    let failure = |message: &str, task_id: &str| FailureInfo {
        phase: Phase::Execute,
        message: message.to_string(),
        task_id: Some(task_id.to_string()),
        infra_ref_id: None,
        multi_task: false,
    };

    let carrier = resolutions
        .iter()
        .find(|(_, r)| r.carries_result && !r.synthetic);

    if let Some((task_id, resolution)) = carrier {
        if resolution.execution_status == Some(CommandExecutionStatus::Skipped) {
            let reason = match &resolution.outcome {
                TaskOutcome::Failure(reason) | TaskOutcome::Cancelled(reason) => reason.as_str(),
                TaskOutcome::Success(_) => "task was skipped",
            };
            return StepOutcome::skipped(step_id, failure(reason, task_id));
        }
    }

    // The carrier's own failure is reported ahead of a sibling's
    let real_failure = carrier
        .into_iter()
        .chain(resolutions.iter())
        .find_map(|(task_id, r)| match &r.outcome {
            TaskOutcome::Failure(reason) if !r.synthetic => Some((task_id, reason)),
            _ => None,
        });
    if let Some((task_id, reason)) = real_failure {
        return StepOutcome::failed(
            step_id,
            FailureInfo {
                multi_task,
                ..failure(reason, task_id)
            },
        );
    }

    if let Some((task_id, resolution)) = carrier {
        match &resolution.outcome {
            TaskOutcome::Success(vars) => return StepOutcome::succeeded(step_id, vars.clone()),
            TaskOutcome::Cancelled(reason) => {
                return StepOutcome::aborted(step_id, failure(reason, task_id))
            }
            TaskOutcome::Failure(_) => {}
        }
    }

    let cancellation = resolutions.iter().find_map(|(task_id, r)| match &r.outcome {
        TaskOutcome::Cancelled(reason) => Some((task_id, reason)),
        _ => None,
    });
    if let Some((task_id, reason)) = cancellation {
        return StepOutcome::aborted(step_id, failure(reason, task_id));
    }

    StepOutcome::failed(
        step_id,
        FailureInfo {
            phase: Phase::Execute,
            message: "no task response carried an execution result".to_string(),
            task_id: None,
            infra_ref_id: None,
            multi_task: false,
        },
    )
}
