//! Execution infrastructure shared by the steps of a stage.

pub mod lifecycle;
pub mod types;

pub use lifecycle::{CleanupReport, InfraLifecycleController, InitInfraRequest};
pub use types::{
    validate_step_specs, ComputeResource, ExecutionInfraScope, InfraStatus, ResourceDefaults,
    SecretRef, SecurityContext, ShellType, StepKind, StepSpec,
};
