//! Wire types for the remote task-submission protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::codec::CodecKind;
use crate::infra::types::StepSpec;

/// Account scope every remote call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountScope {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
}

impl AccountScope {
    pub fn new(
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: org_id.into(),
            project_id: project_id.into(),
        }
    }
}

/// Task-type tag understood by the delegates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "CI_INIT_INFRA")]
    InitInfra,
    #[serde(rename = "CI_EXECUTE_STEP")]
    ExecuteStep,
    #[serde(rename = "CI_CLEANUP")]
    CleanupInfra,
    /// Placeholder reserving delegate capacity in dual-task mode.
    #[serde(rename = "CI_LE_STATUS")]
    ParkedStatus,
    /// Lite-engine task performing the step in dual-task mode.
    #[serde(rename = "CI_BUILD")]
    LiteEngine,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::InitInfra => "CI_INIT_INFRA",
            TaskType::ExecuteStep => "CI_EXECUTE_STEP",
            TaskType::CleanupInfra => "CI_CLEANUP",
            TaskType::ParkedStatus => "CI_LE_STATUS",
            TaskType::LiteEngine => "CI_BUILD",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the submit call waits for the task to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMode {
    Sync,
    Async,
}

/// Execution stage of a task as reported by the dispatch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStage {
    Queued,
    Validating,
    Executing,
    Finished,
    Failed,
    Abandoned,
    Expired,
    Cancelled,
    Unknown,
}

impl TaskExecutionStage {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskExecutionStage::Finished
                | TaskExecutionStage::Failed
                | TaskExecutionStage::Abandoned
                | TaskExecutionStage::Expired
                | TaskExecutionStage::Cancelled
        )
    }
}

/// Opaque token identifying who to notify on task completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(pub String);

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the dispatch service delivers completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackDescriptor {
    pub url: String,
    pub namespace: String,
}

/// Codec-encoded task parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedParams {
    pub codec: CodecKind,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// Everything the dispatch service needs to queue one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub account: AccountScope,
    pub task_type: TaskType,
    pub parameters: EncodedParams,
    pub execution_timeout_ms: u64,
    pub log_keys: Vec<String>,
    pub selectors: Vec<String>,
    pub force_execute: bool,
    pub parked: bool,
    pub setup_abstractions: BTreeMap<String, String>,
}

impl TaskDescriptor {
    pub fn new(account: AccountScope, task_type: TaskType, parameters: EncodedParams) -> Self {
        let mut setup_abstractions = BTreeMap::new();
        setup_abstractions.insert("accountId".to_string(), account.account_id.clone());
        setup_abstractions.insert("orgIdentifier".to_string(), account.org_id.clone());
        setup_abstractions.insert("projectIdentifier".to_string(), account.project_id.clone());

        Self {
            account,
            task_type,
            parameters,
            execution_timeout_ms: 0,
            log_keys: Vec::new(),
            selectors: Vec::new(),
            force_execute: false,
            parked: false,
            setup_abstractions,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_log_keys(mut self, log_keys: Vec<String>) -> Self {
        self.log_keys = log_keys;
        self
    }

    pub fn with_selectors(mut self, selectors: Vec<String>) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_force_execute(mut self, force: bool) -> Self {
        self.force_execute = force;
        self
    }

    pub fn with_parked(mut self, parked: bool) -> Self {
        self.parked = parked;
        self
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// Log configuration handed to the provisioned infrastructure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub log_prefix: String,
    pub log_service_url: Option<String>,
}

/// Infrastructure description carried by an Init task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraSpec {
    pub steps: Vec<StepSpec>,
    pub log_config: LogConfig,
}

/// Parameters of an Init task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub infra: InfraSpec,
    pub selectors: Vec<String>,
    pub execution_timeout_ms: u64,
}

/// Parameters of a single-task Execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub infra_ref_id: String,
    pub step_id: String,
    pub entrypoint: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_var_outputs: Vec<String>,
    pub execution_timeout_ms: u64,
}

/// Parameters of a Cleanup task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub account_id: String,
    pub infra_ref_id: String,
}

/// Parameters of the parked placeholder task in dual-task mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedTaskParams {
    pub step_id: String,
    pub log_key: String,
}

/// Parameters of the lite-engine task in dual-task mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteEngineParams {
    pub parked_task_id: String,
    pub step: StepSpec,
    pub log_key: String,
    pub execution_timeout_ms: u64,
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
