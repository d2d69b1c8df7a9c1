//! Wiring of the dispatch client, the stores and the controllers.

use std::sync::Arc;

use tracing::info;

use crate::abort::AbortCoordinator;
use crate::config::{ConfigError, OrchestratorConfig, StoreBackend};
use crate::dispatch::client::{HttpDispatchClient, TaskDispatchClient};
use crate::dispatch::dispatcher::TaskDispatcher;
use crate::error::OrchestratorError;
use crate::infra::lifecycle::{InfraLifecycleController, InitInfraRequest};
use crate::router::CallbackRouter;
use crate::step::async_step::{ContainerStep, InitInfraStep};
use crate::step::controller::{StepExecutionController, StepExecutionRequest};
use crate::step::outcome::SiblingAbortPolicy;
use crate::store::{CallbackCorrelationStore, PostgresStore, RedisStore, SweepingOutputChannel};

/// Shared services of one orchestrator process.
pub struct Orchestrator {
    config: OrchestratorConfig,
    dispatcher: Arc<TaskDispatcher>,
    correlations: Arc<dyn CallbackCorrelationStore>,
    outputs: Arc<dyn SweepingOutputChannel>,
    infra: Arc<InfraLifecycleController>,
    steps: Arc<StepExecutionController>,
    abort: Arc<AbortCoordinator>,
    router: CallbackRouter,
}

impl Orchestrator {
    /// Connects the configured store backend and the HTTP dispatch client.
    ///
    /// Postgres migrations are not applied here; run `migrate` first.
    pub async fn connect(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let client = HttpDispatchClient::new(config.dispatch_url.clone(), config.rpc_deadlines)
            .map_err(|e| ConfigError::InvalidValue {
                key: "ORCH_DISPATCH_URL".to_string(),
                message: e.to_string(),
            })?;

        let (correlations, outputs): (
            Arc<dyn CallbackCorrelationStore>,
            Arc<dyn SweepingOutputChannel>,
        ) = match config.store_backend {
            StoreBackend::Redis => {
                let store = Arc::new(
                    RedisStore::connect(&config.redis_url, &config.key_prefix)
                        .await?
                        .with_record_ttl(config.record_ttl),
                );
                (
                    store.clone() as Arc<dyn CallbackCorrelationStore>,
                    store as Arc<dyn SweepingOutputChannel>,
                )
            }
            StoreBackend::Postgres => {
                let store = Arc::new(
                    PostgresStore::connect(&config.database_url)
                        .await?
                        .with_record_ttl(config.record_ttl),
                );
                (
                    store.clone() as Arc<dyn CallbackCorrelationStore>,
                    store as Arc<dyn SweepingOutputChannel>,
                )
            }
        };

        info!(
            dispatch_url = %client.base_url(),
            backend = ?config.store_backend,
            mode = ?config.dispatch_mode,
            "Orchestrator connected"
        );
        Ok(Self::from_parts(config, Arc::new(client), correlations, outputs))
    }

    pub fn from_parts(
        config: OrchestratorConfig,
        client: Arc<dyn TaskDispatchClient>,
        correlations: Arc<dyn CallbackCorrelationStore>,
        outputs: Arc<dyn SweepingOutputChannel>,
    ) -> Self {
        let dispatcher = Arc::new(TaskDispatcher::new(client, &config));
        Self::build(
            config,
            dispatcher,
            correlations,
            outputs,
            SiblingAbortPolicy::default(),
        )
    }

    /// Replaces the predicate deciding which task outcomes cancel siblings.
    pub fn with_abort_policy(self, policy: SiblingAbortPolicy) -> Self {
        Self::build(
            self.config,
            self.dispatcher,
            self.correlations,
            self.outputs,
            policy,
        )
    }

    fn build(
        config: OrchestratorConfig,
        dispatcher: Arc<TaskDispatcher>,
        correlations: Arc<dyn CallbackCorrelationStore>,
        outputs: Arc<dyn SweepingOutputChannel>,
        policy: SiblingAbortPolicy,
    ) -> Self {
        let infra = Arc::new(InfraLifecycleController::new(
            dispatcher.clone(),
            correlations.clone(),
            outputs.clone(),
            &config,
        ));
        let steps = Arc::new(
            StepExecutionController::new(
                dispatcher.clone(),
                correlations.clone(),
                outputs.clone(),
                infra.clone(),
                &config,
            )
            .with_abort_policy(policy),
        );
        let abort = Arc::new(AbortCoordinator::new(
            infra.clone(),
            steps.clone(),
            correlations.clone(),
        ));
        let router = CallbackRouter::new(correlations.clone(), infra.clone(), steps.clone());

        Self {
            config,
            dispatcher,
            correlations,
            outputs,
            infra,
            steps,
            abort,
            router,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn correlations(&self) -> &Arc<dyn CallbackCorrelationStore> {
        &self.correlations
    }

    pub fn outputs(&self) -> &Arc<dyn SweepingOutputChannel> {
        &self.outputs
    }

    pub fn infra(&self) -> &Arc<InfraLifecycleController> {
        &self.infra
    }

    pub fn steps(&self) -> &Arc<StepExecutionController> {
        &self.steps
    }

    pub fn abort(&self) -> &Arc<AbortCoordinator> {
        &self.abort
    }

    pub fn router(&self) -> &CallbackRouter {
        &self.router
    }

    pub fn init_infra_step(&self, request: InitInfraRequest) -> InitInfraStep {
        InitInfraStep::new(
            request,
            self.infra.clone(),
            self.abort.clone(),
            self.correlations.clone(),
        )
    }

    /// A container step; `release_infra` marks it as the last user of the
    /// stage's infra. The flag is recorded with the step's handles.
    pub fn container_step(&self, request: StepExecutionRequest, release_infra: bool) -> ContainerStep {
        ContainerStep::new(
            StepExecutionRequest {
                release_infra,
                ..request
            },
            self.steps.clone(),
            self.abort.clone(),
        )
    }
}
