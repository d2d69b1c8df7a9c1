//! Records kept in the durable stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::types::{AccountScope, TaskType};
use crate::error::Phase;
use crate::step::outcome::{CommandExecutionStatus, TaskOutcome, TaskResponse};

/// Well-known sweeping key holding a stage's infra reference id.
pub const INFRA_OUTPUT_KEY: &str = "KubernetesInfraOutput";

/// Sweeping key holding the serialized [`ExecutionInfraScope`](crate::infra::ExecutionInfraScope).
pub const INFRA_SCOPE_KEY: &str = "ExecutionInfraScope";

/// One execution of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageScope {
    pub account: AccountScope,
    pub stage_execution_id: String,
}

impl StageScope {
    pub fn new(account: AccountScope, stage_execution_id: impl Into<String>) -> Self {
        Self {
            account,
            stage_execution_id: stage_execution_id.into(),
        }
    }

    /// Stable key identifying the stage in storage.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.account.account_id,
            self.account.org_id,
            self.account.project_id,
            self.stage_execution_id
        )
    }
}

/// Correlation id of one outstanding remote task. The id is the task id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackHandle {
    pub id: String,
    pub phase: Phase,
    pub task_type: TaskType,
    pub issued_at: DateTime<Utc>,
}

impl CallbackHandle {
    pub fn new(id: impl Into<String>, phase: Phase, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            phase,
            task_type,
            issued_at: Utc::now(),
        }
    }
}

/// Which controller owns a handle, and what it needs to resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationContext {
    Infra {
        owner_execution_id: String,
    },
    Step {
        step_id: String,
        step_execution_id: String,
        /// Every handle issued for the step, this one included.
        siblings: Vec<String>,
        /// Release the stage's infra once the step completes.
        #[serde(default)]
        release_infra: bool,
    },
    Cleanup {
        infra_ref_id: String,
    },
}

/// How a handle resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: TaskOutcome,
    pub execution_status: Option<CommandExecutionStatus>,
    /// The response was the authoritative execution result of a step.
    pub carries_result: bool,
    /// Resolved locally by a forced cancellation rather than a delivery.
    pub synthetic: bool,
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn from_response(response: &TaskResponse) -> Self {
        Self {
            outcome: response.outcome(),
            execution_status: response.execution_status(),
            carries_result: response.carries_execution_result(),
            synthetic: false,
            resolved_at: Utc::now(),
        }
    }

    pub fn synthetic_cancel(reason: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Cancelled(reason.into()),
            execution_status: None,
            carries_result: false,
            synthetic: true,
            resolved_at: Utc::now(),
        }
    }
}

/// Stored correlation of one callback id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    pub handle: CallbackHandle,
    pub stage: StageScope,
    pub context: CorrelationContext,
    pub log_prefix: String,
    pub resolution: Option<Resolution>,
}

impl CorrelationEntry {
    pub fn new(
        handle: CallbackHandle,
        stage: StageScope,
        context: CorrelationContext,
        log_prefix: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            stage,
            context,
            log_prefix: log_prefix.into(),
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Result of a first-writer-wins resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveResult {
    /// This call resolved the handle.
    Applied(CorrelationEntry),
    /// The handle was resolved earlier; the entry carries the earlier resolution.
    AlreadyResolved(CorrelationEntry),
    /// No entry exists for the id.
    Unknown,
}

/// Durable handoff value scoped to one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepingRecord {
    pub scope: StageScope,
    pub key: String,
    pub value: String,
    pub written_at: DateTime<Utc>,
}

impl SweepingRecord {
    pub fn new(scope: StageScope, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scope,
            key: key.into(),
            value: value.into(),
            written_at: Utc::now(),
        }
    }

    pub fn infra_output(scope: StageScope, infra_ref_id: impl Into<String>) -> Self {
        Self::new(scope, INFRA_OUTPUT_KEY, infra_ref_id)
    }
}
