//! Step execution: dispatch, callback reduction and the step contract.

pub mod async_step;
pub mod controller;
pub mod outcome;
pub mod timeout;

pub use async_step::{AsyncStep, ContainerStep, InitInfraStep};
pub use controller::{
    AsyncExecutableResponse, CancelReport, IgnoredReason, StepExecutionController,
    StepExecutionRequest, StepProgress,
};
pub use outcome::{
    derive_outcome, CommandExecutionStatus, FailureInfo, InitInfraResult, SiblingAbortPolicy,
    Status, StepExecutionResult, StepOutcome, TaskOutcome, TaskResponse, ABORT_MESSAGE,
    SIBLING_ABORT_MESSAGE,
};
pub use timeout::{parse_timeout, TimeoutBudget, TimeoutError};
