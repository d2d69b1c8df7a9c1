//! infra_orchestrator: remote-execution orchestration for containerized
//! pipeline steps.
//!
//! This library provisions per-stage execution infrastructure through remote
//! delegates, dispatches steps against it, reduces the asynchronous task
//! callbacks of a step to exactly one outcome and tears the infrastructure
//! down again.

// Core modules
pub mod abort;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod infra;
pub mod metrics;
pub mod orchestrator;
pub mod router;
pub mod step;
pub mod store;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, DispatchMode, OrchestratorConfig, StoreBackend};
pub use error::{CodecError, DispatchError, OrchestratorError, Phase, StoreError};
pub use orchestrator::Orchestrator;
pub use router::{CallbackRouter, Delivery};
pub use step::{AsyncStep, StepOutcome, TaskOutcome, TaskResponse};
