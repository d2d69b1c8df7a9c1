//! Orchestrator configuration.
//!
//! Covers the dispatch transport, codec selection, dispatch strategy, the
//! durable store backend and the timeout constants used when budgeting remote
//! task deadlines.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::codec::CodecKind;
use crate::infra::types::ResourceDefaults;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// How a step is dispatched against the delegate fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One Execute task against a pre-provisioned infra scope.
    #[default]
    SingleTask,
    /// Legacy parked placeholder task plus a lite-engine task.
    DualTask,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single-task" => Ok(DispatchMode::SingleTask),
            "dual" | "dual-task" | "legacy" => Ok(DispatchMode::DualTask),
            other => Err(format!("unknown dispatch mode '{}'", other)),
        }
    }
}

/// Durable store technology behind the correlation and sweeping contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Redis,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Per-operation RPC deadlines for the dispatch client.
///
/// These bound the registering call only; a task's execution timeout is
/// carried separately in its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcDeadlines {
    pub submit: Duration,
    pub cancel: Duration,
    pub progress: Duration,
    pub register_callback: Duration,
}

impl RpcDeadlines {
    /// Same deadline for every operation.
    pub fn uniform(deadline: Duration) -> Self {
        Self {
            submit: deadline,
            cancel: deadline,
            progress: deadline,
            register_callback: deadline,
        }
    }
}

impl Default for RpcDeadlines {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(30))
    }
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Dispatch settings
    /// Base URL of the task submission service.
    pub dispatch_url: String,
    /// URL delegates report task completions to.
    pub callback_url: String,
    /// RPC deadlines for dispatch operations.
    pub rpc_deadlines: RpcDeadlines,
    /// Codec used for task parameters.
    pub codec: CodecKind,
    /// Step dispatch strategy.
    pub dispatch_mode: DispatchMode,
    /// How long a submitted task may be held before assignment.
    pub hold_for: Duration,
    /// Whether submitted tasks bypass delegate capability checks.
    pub force_execute: bool,

    // Store settings
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub database_url: String,
    /// Prefix for every key written by the Redis backend.
    pub key_prefix: String,
    /// How long correlation, resolution, outcome and sweeping records live.
    pub record_ttl: Duration,

    // Timeout settings
    /// Floor applied to every computed dispatch timeout.
    pub min_dispatch_timeout: Duration,
    /// Elapsed time assumed when a step's group start is unknown.
    pub default_group_elapsed: Duration,
    /// Execution timeout of cleanup tasks.
    pub cleanup_timeout: Duration,

    // Container defaults
    pub default_cpu: String,
    pub default_memory: String,
    /// Log service endpoint handed to the infra in its log config.
    pub log_service_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_url: "http://localhost:9090".to_string(),
            callback_url: "http://localhost:8080/v1/callbacks".to_string(),
            rpc_deadlines: RpcDeadlines::default(),
            codec: CodecKind::Json,
            dispatch_mode: DispatchMode::SingleTask,
            hold_for: Duration::ZERO,
            force_execute: false,

            store_backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/orchestrator".to_string(),
            key_prefix: "orchestrator".to_string(),
            record_ttl: Duration::from_secs(604800), // 7 days

            min_dispatch_timeout: Duration::from_millis(100),
            default_group_elapsed: Duration::from_secs(600), // 10 minutes
            cleanup_timeout: Duration::from_secs(600),       // 10 minutes

            default_cpu: "100m".to_string(),
            default_memory: "100Mi".to_string(),
            log_service_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ORCH_DISPATCH_URL`: Task submission service URL
    /// - `ORCH_CALLBACK_URL`: Callback URL registered with the dispatcher
    /// - `ORCH_RPC_DEADLINE_SECS`: Deadline for every dispatch RPC (default: 30)
    /// - `ORCH_CODEC`: `json` or `binary` (default: json)
    /// - `ORCH_DISPATCH_MODE`: `single` or `dual` (default: single)
    /// - `ORCH_HOLD_FOR_SECS`: Hold duration for submitted tasks (default: 0)
    /// - `ORCH_FORCE_EXECUTE`: Bypass capability checks (default: false)
    /// - `ORCH_STORE_BACKEND`: `redis` or `postgres` (default: redis)
    /// - `REDIS_URL`: Redis connection URL
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `ORCH_KEY_PREFIX`: Redis key prefix (default: orchestrator)
    /// - `ORCH_RECORD_TTL_SECS`: Lifetime of stored records (default: 604800)
    /// - `ORCH_MIN_DISPATCH_TIMEOUT_MS`: Timeout floor (default: 100)
    /// - `ORCH_DEFAULT_GROUP_ELAPSED_SECS`: Assumed group elapsed time (default: 600)
    /// - `ORCH_CLEANUP_TIMEOUT_SECS`: Cleanup task timeout (default: 600)
    /// - `ORCH_DEFAULT_CPU` / `ORCH_DEFAULT_MEMORY`: Container defaults
    /// - `ORCH_LOG_SERVICE_URL`: Log service endpoint
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// selected backend's URL is missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Dispatch settings
        if let Ok(val) = std::env::var("ORCH_DISPATCH_URL") {
            config.dispatch_url = val;
        }

        if let Ok(val) = std::env::var("ORCH_CALLBACK_URL") {
            config.callback_url = val;
        }

        if let Ok(val) = std::env::var("ORCH_RPC_DEADLINE_SECS") {
            let secs: u64 = parse_env_value(&val, "ORCH_RPC_DEADLINE_SECS")?;
            config.rpc_deadlines = RpcDeadlines::uniform(Duration::from_secs(secs));
        }

        if let Ok(val) = std::env::var("ORCH_CODEC") {
            config.codec = parse_env_value(&val, "ORCH_CODEC")?;
        }

        if let Ok(val) = std::env::var("ORCH_DISPATCH_MODE") {
            config.dispatch_mode = parse_env_value(&val, "ORCH_DISPATCH_MODE")?;
        }

        if let Ok(val) = std::env::var("ORCH_HOLD_FOR_SECS") {
            let secs: u64 = parse_env_value(&val, "ORCH_HOLD_FOR_SECS")?;
            config.hold_for = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ORCH_FORCE_EXECUTE") {
            config.force_execute = parse_env_bool(&val, "ORCH_FORCE_EXECUTE")?;
        }

        // Store settings
        if let Ok(val) = std::env::var("ORCH_STORE_BACKEND") {
            config.store_backend = parse_env_value(&val, "ORCH_STORE_BACKEND")?;
        }

        match config.store_backend {
            StoreBackend::Redis => {
                if let Ok(val) = std::env::var("REDIS_URL") {
                    config.redis_url = val;
                }
            }
            StoreBackend::Postgres => {
                config.database_url = std::env::var("DATABASE_URL")
                    .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;
            }
        }

        if let Ok(val) = std::env::var("ORCH_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Ok(val) = std::env::var("ORCH_RECORD_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "ORCH_RECORD_TTL_SECS")?;
            config.record_ttl = Duration::from_secs(secs);
        }

        // Timeout settings
        if let Ok(val) = std::env::var("ORCH_MIN_DISPATCH_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "ORCH_MIN_DISPATCH_TIMEOUT_MS")?;
            config.min_dispatch_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("ORCH_DEFAULT_GROUP_ELAPSED_SECS") {
            let secs: u64 = parse_env_value(&val, "ORCH_DEFAULT_GROUP_ELAPSED_SECS")?;
            config.default_group_elapsed = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("ORCH_CLEANUP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "ORCH_CLEANUP_TIMEOUT_SECS")?;
            config.cleanup_timeout = Duration::from_secs(secs);
        }

        // Container defaults
        if let Ok(val) = std::env::var("ORCH_DEFAULT_CPU") {
            config.default_cpu = val;
        }

        if let Ok(val) = std::env::var("ORCH_DEFAULT_MEMORY") {
            config.default_memory = val;
        }

        if let Ok(val) = std::env::var("ORCH_LOG_SERVICE_URL") {
            config.log_service_url = Some(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "dispatch_url cannot be empty".to_string(),
            ));
        }

        if self.callback_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "callback_url cannot be empty".to_string(),
            ));
        }

        let deadlines = [
            self.rpc_deadlines.submit,
            self.rpc_deadlines.cancel,
            self.rpc_deadlines.progress,
            self.rpc_deadlines.register_callback,
        ];
        if deadlines.iter().any(|d| d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "rpc deadlines must be greater than 0".to_string(),
            ));
        }

        // A zero floor would let a nearly expired group issue a zero deadline.
        if self.min_dispatch_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "min_dispatch_timeout must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cleanup_timeout must be greater than 0".to_string(),
            ));
        }

        match self.store_backend {
            StoreBackend::Redis if self.redis_url.is_empty() => {
                return Err(ConfigError::ValidationFailed(
                    "redis_url cannot be empty".to_string(),
                ));
            }
            StoreBackend::Postgres if self.database_url.is_empty() => {
                return Err(ConfigError::ValidationFailed(
                    "database_url cannot be empty".to_string(),
                ));
            }
            _ => {}
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        // Redis rejects an EX of zero.
        if self.record_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "record_ttl must be at least one second".to_string(),
            ));
        }

        if self.default_cpu.is_empty() || self.default_memory.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default container resources cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Container resources applied to steps that declare none.
    pub fn resource_defaults(&self) -> ResourceDefaults {
        ResourceDefaults {
            cpu: self.default_cpu.clone(),
            memory: self.default_memory.clone(),
        }
    }

    /// Builder method to set the dispatch service URL.
    pub fn with_dispatch_url(mut self, url: impl Into<String>) -> Self {
        self.dispatch_url = url.into();
        self
    }

    /// Builder method to set the callback URL.
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = url.into();
        self
    }

    /// Builder method to set every RPC deadline at once.
    pub fn with_rpc_deadline(mut self, deadline: Duration) -> Self {
        self.rpc_deadlines = RpcDeadlines::uniform(deadline);
        self
    }

    /// Builder method to set the parameter codec.
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    /// Builder method to set the dispatch mode.
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Builder method to set the store backend.
    pub fn with_store_backend(mut self, backend: StoreBackend) -> Self {
        self.store_backend = backend;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the Redis key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set the stored record lifetime.
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// Builder method to set the dispatch timeout floor.
    pub fn with_min_dispatch_timeout(mut self, floor: Duration) -> Self {
        self.min_dispatch_timeout = floor;
        self
    }

    /// Builder method to set the cleanup task timeout.
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Builder method to set the task hold duration.
    pub fn with_hold_for(mut self, hold_for: Duration) -> Self {
        self.hold_for = hold_for;
        self
    }
}

/// Parses an environment variable value into the specified type.
fn parse_env_value<T: FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses an environment variable value as a boolean.
fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", val),
        }),
    }
}
