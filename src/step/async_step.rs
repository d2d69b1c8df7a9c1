//! The uniform contract the pipeline engine drives steps through.
//!
//! A step is validated, dispatched with [`AsyncStep::execute_async`], fed
//! callbacks as they arrive, and finally asked for its outcome. Both
//! implementations are thin adapters over the controllers; all state they need
//! to resume lives in the durable stores.

use std::sync::Arc;

use async_trait::async_trait;

use super::controller::{
    AsyncExecutableResponse, IgnoredReason, StepExecutionController, StepExecutionRequest,
    StepProgress,
};
use super::outcome::{StepOutcome, TaskResponse};
use crate::abort::{AbortCoordinator, AbortReport};
use crate::error::{OrchestratorError, Phase};
use crate::infra::lifecycle::{InfraLifecycleController, InitInfraRequest};
use crate::infra::types::validate_step_specs;
use crate::store::CallbackCorrelationStore;

#[async_trait]
pub trait AsyncStep: Send + Sync {
    /// Checks the step definition without any remote call.
    fn validate(&self) -> Result<(), OrchestratorError>;

    /// Dispatches the step and returns the handles to wait on.
    async fn execute_async(&self) -> Result<AsyncExecutableResponse, OrchestratorError>;

    async fn on_callback(
        &self,
        callback_id: &str,
        response: TaskResponse,
    ) -> Result<StepProgress, OrchestratorError>;

    /// Aborts a step dispatched by `execute_async`.
    async fn on_abort(
        &self,
        response: &AsyncExecutableResponse,
    ) -> Result<AbortReport, OrchestratorError>;

    /// The step's outcome, or `OutcomeNotReady` while handles are outstanding.
    async fn produce_outcome(&self) -> Result<StepOutcome, OrchestratorError>;

    /// The outcome, with failures and aborts surfaced as errors.
    async fn conclude(&self) -> Result<StepOutcome, OrchestratorError> {
        self.produce_outcome().await?.into_result()
    }
}

/// Provisions the infra of a stage.
pub struct InitInfraStep {
    request: InitInfraRequest,
    infra: Arc<InfraLifecycleController>,
    abort: Arc<AbortCoordinator>,
    correlations: Arc<dyn CallbackCorrelationStore>,
}

impl InitInfraStep {
    pub fn new(
        request: InitInfraRequest,
        infra: Arc<InfraLifecycleController>,
        abort: Arc<AbortCoordinator>,
        correlations: Arc<dyn CallbackCorrelationStore>,
    ) -> Self {
        Self {
            request,
            infra,
            abort,
            correlations,
        }
    }

    fn execution_id(&self) -> &str {
        &self.request.owner_execution_id
    }
}

#[async_trait]
impl AsyncStep for InitInfraStep {
    fn validate(&self) -> Result<(), OrchestratorError> {
        validate_step_specs(&self.request.step_specs)
    }

    async fn execute_async(&self) -> Result<AsyncExecutableResponse, OrchestratorError> {
        let handle = self.infra.initiate(self.request.clone()).await?;
        Ok(AsyncExecutableResponse {
            callback_ids: vec![handle.id],
            log_keys: vec![self.request.log_prefix.clone()],
        })
    }

    async fn on_callback(
        &self,
        callback_id: &str,
        response: TaskResponse,
    ) -> Result<StepProgress, OrchestratorError> {
        let result = response.into_init_result().map_err(|other| {
            OrchestratorError::UnexpectedResponse {
                phase: Phase::Init,
                callback_id: callback_id.to_string(),
                detail: format!("{} response for an init task", other.kind()),
            }
        })?;

        let settlement = self.infra.settle_init(callback_id, result).await?;
        if let Some(outcome) = settlement.claimed {
            return Ok(StepProgress::Completed(outcome));
        }

        let completed = self
            .correlations
            .completed_outcome(self.execution_id())
            .await?
            .is_some();
        Ok(StepProgress::Ignored(if completed {
            IgnoredReason::AlreadyCompleted
        } else {
            IgnoredReason::Duplicate
        }))
    }

    async fn on_abort(
        &self,
        response: &AsyncExecutableResponse,
    ) -> Result<AbortReport, OrchestratorError> {
        self.abort
            .abort_step(&self.request.stage, &response.callback_ids)
            .await
    }

    async fn produce_outcome(&self) -> Result<StepOutcome, OrchestratorError> {
        self.correlations
            .completed_outcome(self.execution_id())
            .await?
            .ok_or_else(|| OrchestratorError::OutcomeNotReady(self.execution_id().to_string()))
    }
}

/// Runs one container step on the stage's infra.
///
/// Releasing the infra after a failed step, or after the step marked as its
/// last user, happens in the controller so any process can do it.
pub struct ContainerStep {
    request: StepExecutionRequest,
    steps: Arc<StepExecutionController>,
    abort: Arc<AbortCoordinator>,
}

impl ContainerStep {
    pub fn new(
        request: StepExecutionRequest,
        steps: Arc<StepExecutionController>,
        abort: Arc<AbortCoordinator>,
    ) -> Self {
        Self {
            request,
            steps,
            abort,
        }
    }
}

#[async_trait]
impl AsyncStep for ContainerStep {
    fn validate(&self) -> Result<(), OrchestratorError> {
        self.request.spec.validate()
    }

    async fn execute_async(&self) -> Result<AsyncExecutableResponse, OrchestratorError> {
        self.steps.execute(self.request.clone()).await
    }

    async fn on_callback(
        &self,
        callback_id: &str,
        response: TaskResponse,
    ) -> Result<StepProgress, OrchestratorError> {
        self.steps.on_callback(callback_id, response).await
    }

    async fn on_abort(
        &self,
        response: &AsyncExecutableResponse,
    ) -> Result<AbortReport, OrchestratorError> {
        self.abort
            .abort_step(&self.request.stage, &response.callback_ids)
            .await
    }

    async fn produce_outcome(&self) -> Result<StepOutcome, OrchestratorError> {
        self.steps
            .outcome(&self.request.step_execution_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::OutcomeNotReady(self.request.step_execution_id.clone())
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::types::TaskType;
    use crate::step::outcome::{CommandExecutionStatus, InitInfraResult, Status, StepExecutionResult};
    use crate::store::types::INFRA_OUTPUT_KEY;
    use crate::test_support::{run_spec, stage, Harness};

    fn init_request() -> InitInfraRequest {
        InitInfraRequest {
            stage: stage(),
            owner_execution_id: "init-exec".to_string(),
            step_specs: vec![run_spec("build")],
            log_prefix: "logs/stage-1".to_string(),
            timeout: Duration::from_secs(600),
            selectors: Vec::new(),
        }
    }

    fn step_request(step_id: &str) -> StepExecutionRequest {
        StepExecutionRequest {
            stage: stage(),
            step_execution_id: format!("exec-{}", step_id),
            spec: run_spec(step_id),
            declared_timeout: Duration::from_secs(600),
            group_started_at: None,
            log_prefix: "logs/stage-1".to_string(),
            selectors: Vec::new(),
            release_infra: false,
        }
    }

    fn step_result(status: CommandExecutionStatus) -> TaskResponse {
        let error_message = match status {
            CommandExecutionStatus::Failure => Some("exit code 1".to_string()),
            _ => None,
        };
        TaskResponse::StepExecution(StepExecutionResult {
            status,
            output_vars: Default::default(),
            error_message,
        })
    }

    async fn ready_infra(harness: &Harness) {
        let init = harness.orchestrator.init_infra_step(init_request());
        let response = init.execute_async().await.unwrap();
        init.on_callback(
            &response.callback_ids[0],
            TaskResponse::InitInfra(InitInfraResult::success("infra-1")),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_init_step_completes_once() {
        let harness = Harness::single_task();
        let init = harness.orchestrator.init_infra_step(init_request());
        init.validate().unwrap();

        let response = init.execute_async().await.unwrap();
        assert_eq!(response.log_keys, vec!["logs/stage-1".to_string()]);
        assert!(matches!(
            init.produce_outcome().await,
            Err(OrchestratorError::OutcomeNotReady(_))
        ));

        let reply = TaskResponse::InitInfra(InitInfraResult::success("infra-1"));
        let first = init
            .on_callback(&response.callback_ids[0], reply.clone())
            .await
            .unwrap();
        assert!(matches!(first, StepProgress::Completed(ref o) if o.is_success()));

        let again = init.on_callback(&response.callback_ids[0], reply).await.unwrap();
        assert_eq!(again, StepProgress::Ignored(IgnoredReason::AlreadyCompleted));
        assert_eq!(init.produce_outcome().await.unwrap().status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_init_step_error_notify_fails_step() {
        let harness = Harness::single_task();
        let init = harness.orchestrator.init_infra_step(init_request());
        let response = init.execute_async().await.unwrap();

        let progress = init
            .on_callback(
                &response.callback_ids[0],
                TaskResponse::ErrorNotify {
                    message: "delegate lost".to_string(),
                },
            )
            .await
            .unwrap();

        let StepProgress::Completed(outcome) = progress else {
            panic!("init step should complete");
        };
        assert_eq!(outcome.status, Status::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.phase, Phase::Init);
        assert_eq!(failure.message, "delegate lost");
    }

    #[tokio::test]
    async fn test_init_step_rejects_step_responses() {
        let harness = Harness::single_task();
        let init = harness.orchestrator.init_infra_step(init_request());
        let response = init.execute_async().await.unwrap();

        let err = init
            .on_callback(&response.callback_ids[0], TaskResponse::Acknowledged)
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Init));
    }

    #[tokio::test]
    async fn test_last_container_step_releases_infra() {
        let harness = Harness::single_task();
        ready_infra(&harness).await;

        let first = harness.orchestrator.container_step(step_request("build"), false);
        let response = first.execute_async().await.unwrap();
        first
            .on_callback(&response.callback_ids[0], step_result(CommandExecutionStatus::Success))
            .await
            .unwrap();
        assert!(harness.client.submissions_of(TaskType::CleanupInfra).is_empty());

        let last = harness.orchestrator.container_step(step_request("test"), true);
        let response = last.execute_async().await.unwrap();
        last.on_callback(&response.callback_ids[0], step_result(CommandExecutionStatus::Success))
            .await
            .unwrap();

        assert_eq!(harness.client.submissions_of(TaskType::CleanupInfra).len(), 1);
        assert!(harness.store.sweeping_value(&stage(), INFRA_OUTPUT_KEY).is_none());
        assert_eq!(last.produce_outcome().await.unwrap().status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_container_step_releases_infra() {
        let harness = Harness::single_task();
        ready_infra(&harness).await;

        let step = harness.orchestrator.container_step(step_request("build"), false);
        let response = step.execute_async().await.unwrap();
        let progress = step
            .on_callback(&response.callback_ids[0], step_result(CommandExecutionStatus::Failure))
            .await
            .unwrap();

        let StepProgress::Completed(outcome) = progress else {
            panic!("step should complete");
        };
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.failure.unwrap().message, "exit code 1");
        assert_eq!(harness.client.submissions_of(TaskType::CleanupInfra).len(), 1);
    }

    #[tokio::test]
    async fn test_container_step_abort() {
        let harness = Harness::single_task();
        ready_infra(&harness).await;

        let step = harness.orchestrator.container_step(step_request("build"), false);
        let response = step.execute_async().await.unwrap();
        let report = step.on_abort(&response).await.unwrap();
        report.cleanup.await.unwrap();

        assert_eq!(step.produce_outcome().await.unwrap().status, Status::Aborted);
        assert_eq!(harness.client.submissions_of(TaskType::CleanupInfra).len(), 1);
    }

    #[tokio::test]
    async fn test_conclude_surfaces_failures() {
        let harness = Harness::dual_task();

        let step = harness.orchestrator.container_step(step_request("build"), false);
        let response = step.execute_async().await.unwrap();
        step.on_callback(
            &response.callback_ids[1],
            TaskResponse::EngineStatus {
                status: CommandExecutionStatus::Failure,
                error_message: Some("pod evicted".to_string()),
            },
        )
        .await
        .unwrap();

        let err = step.conclude().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::SiblingTaskFailure { ref step_id, ref reason, .. }
                if step_id == "build" && reason == "pod evicted"
        ));
        assert_eq!(err.phase(), Some(Phase::Execute));

        let aborted = harness.orchestrator.container_step(step_request("test"), false);
        let response = aborted.execute_async().await.unwrap();
        aborted.on_abort(&response).await.unwrap();
        assert!(matches!(
            aborted.conclude().await,
            Err(OrchestratorError::AbortRequested { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_step_conclude_maps_failure() {
        let harness = Harness::single_task();
        let init = harness.orchestrator.init_infra_step(init_request());
        let response = init.execute_async().await.unwrap();
        init.on_callback(
            &response.callback_ids[0],
            TaskResponse::InitInfra(InitInfraResult::failure("quota exceeded")),
        )
        .await
        .unwrap();

        let err = init.conclude().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InfraInitialization { ref message, .. } if message == "quota exceeded"));
    }
}
