//! Step and infrastructure definitions.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::store::types::StageScope;

/// Lifecycle status of an [`ExecutionInfraScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfraStatus {
    Initializing,
    Ready,
    Failed,
    CleanedUp,
}

/// One provisioned execution environment shared by the steps of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfraScope {
    pub stage: StageScope,
    /// Assigned by the remote side once Init succeeds.
    pub infra_ref_id: Option<String>,
    pub status: InfraStatus,
    pub owner_execution_id: String,
    pub step_specs: Vec<StepSpec>,
    pub log_prefix: String,
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionInfraScope {
    pub fn initializing(
        stage: StageScope,
        owner_execution_id: impl Into<String>,
        step_specs: Vec<StepSpec>,
        log_prefix: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            infra_ref_id: None,
            status: InfraStatus::Initializing,
            owner_execution_id: owner_execution_id.into(),
            step_specs,
            log_prefix: log_prefix.into(),
            failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn ready(mut self, infra_ref_id: impl Into<String>) -> Self {
        self.infra_ref_id = Some(infra_ref_id.into());
        self.status = InfraStatus::Ready;
        self.updated_at = Utc::now();
        self
    }

    pub fn failed(mut self, infra_ref_id: Option<String>, message: impl Into<String>) -> Self {
        self.infra_ref_id = infra_ref_id;
        self.status = InfraStatus::Failed;
        self.failure = Some(message.into());
        self.updated_at = Utc::now();
        self
    }

    pub fn cleaned_up(mut self) -> Self {
        self.status = InfraStatus::CleanedUp;
        self.updated_at = Utc::now();
        self
    }
}

/// Shell a `Run` step executes its command with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShellType {
    Sh,
    Bash,
    Powershell,
    Pwsh,
    Python,
}

impl ShellType {
    fn entrypoint(&self) -> [&'static str; 2] {
        match self {
            ShellType::Sh => ["sh", "-c"],
            ShellType::Bash => ["bash", "-c"],
            ShellType::Powershell => ["powershell", "-Command"],
            ShellType::Pwsh => ["pwsh", "-Command"],
            ShellType::Python => ["python3", "-c"],
        }
    }
}

/// What a container step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A shell command run inside the image.
    Run { shell: ShellType, command: String },
    /// An image with its own entrypoint, configured through settings.
    Plugin {
        settings: BTreeMap<String, String>,
        entrypoint: Option<Vec<String>>,
    },
}

/// Requested CPU/memory. Unset values fall back to configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResource {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl ComputeResource {
    pub fn new(cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        Self {
            cpu: Some(cpu.into()),
            memory: Some(memory.into()),
        }
    }

    /// Fills unset limits from the defaults.
    pub fn resolved(&self, defaults: &ResourceDefaults) -> ComputeResource {
        ComputeResource {
            cpu: Some(self.cpu.clone().unwrap_or_else(|| defaults.cpu.clone())),
            memory: Some(
                self.memory
                    .clone()
                    .unwrap_or_else(|| defaults.memory.clone()),
            ),
        }
    }
}

/// Container resource defaults applied when a step gives none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefaults {
    pub cpu: String,
    pub memory: String,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            cpu: "100m".to_string(),
            memory: "100Mi".to_string(),
        }
    }
}

/// A secret exposed to the container as an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub env_name: String,
    pub secret_identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityContext {
    pub allow_privilege_escalation: Option<bool>,
    pub privileged: Option<bool>,
    pub proc_mount: Option<String>,
    pub read_only_root_filesystem: Option<bool>,
    pub run_as_non_root: Option<bool>,
    pub run_as_group: Option<i64>,
    pub run_as_user: Option<i64>,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
}

/// Definition of one containerized step. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    pub image: String,
    pub kind: StepKind,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ComputeResource,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
    /// Environment variables exported back as step outputs.
    #[serde(default)]
    pub output_variables: Vec<String>,
}

fn cpu_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+(\.\d+)?m?$").expect("valid cpu pattern"))
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d+(\.\d+)?(Ki|Mi|Gi|Ti|K|M|G|T)?$").expect("valid memory pattern")
    })
}

fn env_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env pattern"))
}

impl StepSpec {
    pub fn run(
        step_id: impl Into<String>,
        image: impl Into<String>,
        shell: ShellType,
        command: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            step_id,
            image,
            StepKind::Run {
                shell,
                command: command.into(),
            },
        )
    }

    pub fn plugin(
        step_id: impl Into<String>,
        image: impl Into<String>,
        settings: BTreeMap<String, String>,
    ) -> Self {
        Self::with_kind(
            step_id,
            image,
            StepKind::Plugin {
                settings,
                entrypoint: None,
            },
        )
    }

    fn with_kind(step_id: impl Into<String>, image: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_id: step_id.into(),
            image: image.into(),
            kind,
            env: BTreeMap::new(),
            resources: ComputeResource::default(),
            secrets: Vec::new(),
            security_context: None,
            output_variables: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ComputeResource) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_secret(mut self, secret: SecretRef) -> Self {
        self.secrets.push(secret);
        self
    }

    pub fn with_security_context(mut self, context: SecurityContext) -> Self {
        self.security_context = Some(context);
        self
    }

    pub fn with_output_variables(mut self, names: Vec<String>) -> Self {
        self.output_variables = names;
        self
    }

    /// Command line the container is started with. Empty means the image default.
    pub fn entrypoint(&self) -> Vec<String> {
        match &self.kind {
            StepKind::Run { shell, command } => {
                let mut args: Vec<String> =
                    shell.entrypoint().iter().map(|s| s.to_string()).collect();
                args.push(command.clone());
                args
            }
            StepKind::Plugin { entrypoint, .. } => entrypoint.clone().unwrap_or_default(),
        }
    }

    /// Environment the container sees: declared env plus plugin settings as
    /// `PLUGIN_<KEY>` variables.
    pub fn container_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if let StepKind::Plugin { settings, .. } = &self.kind {
            for (key, value) in settings {
                env.insert(format!("PLUGIN_{}", key.to_uppercase()), value.clone());
            }
        }
        env
    }

    /// Copy of the step with resource defaults applied.
    pub fn with_default_resources(&self, defaults: &ResourceDefaults) -> StepSpec {
        let mut spec = self.clone();
        spec.resources = self.resources.resolved(defaults);
        spec
    }

    /// Checks the step is dispatchable.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.step_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidStep(
                "step id cannot be empty".to_string(),
            ));
        }

        if self.image.trim().is_empty() {
            return Err(OrchestratorError::InvalidStep(format!(
                "step {} has no image",
                self.step_id
            )));
        }

        if let StepKind::Run { command, .. } = &self.kind {
            if command.trim().is_empty() {
                return Err(OrchestratorError::InvalidStep(format!(
                    "step {} has an empty command",
                    self.step_id
                )));
            }
        }

        if let Some(cpu) = &self.resources.cpu {
            if !cpu_pattern().is_match(cpu) {
                return Err(OrchestratorError::InvalidStep(format!(
                    "step {} has invalid cpu limit '{}'",
                    self.step_id, cpu
                )));
            }
        }

        if let Some(memory) = &self.resources.memory {
            if !memory_pattern().is_match(memory) {
                return Err(OrchestratorError::InvalidStep(format!(
                    "step {} has invalid memory limit '{}'",
                    self.step_id, memory
                )));
            }
        }

        let env_names = self
            .env
            .keys()
            .chain(self.secrets.iter().map(|s| &s.env_name))
            .chain(self.output_variables.iter());
        for name in env_names {
            if !env_name_pattern().is_match(name) {
                return Err(OrchestratorError::InvalidStep(format!(
                    "step {} has invalid environment variable name '{}'",
                    self.step_id, name
                )));
            }
        }

        Ok(())
    }
}

/// Validates a list of specs destined for one infra scope.
pub fn validate_step_specs(specs: &[StepSpec]) -> Result<(), OrchestratorError> {
    if specs.is_empty() {
        return Err(OrchestratorError::InvalidStep(
            "infrastructure needs at least one step".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.step_id.as_str()) {
            return Err(OrchestratorError::InvalidStep(format!(
                "duplicate step id '{}'",
                spec.step_id
            )));
        }
    }

    Ok(())
}
