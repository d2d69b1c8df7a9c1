//! Init / Ready / Cleanup state machine of one infra scope.
//!
//! ```text
//! initiate ──► Initializing ──► on_init_callback ──► Ready ──► request_cleanup ──► CleanedUp
//!                                      │
//!                                      └──► Failed (best-effort cleanup of a partial id)
//! ```
//!
//! The scope record lives in the sweeping channel under [`INFRA_SCOPE_KEY`];
//! its write-once semantics enforce at most one Init per stage. The infra
//! reference id is published separately under [`INFRA_OUTPUT_KEY`] and is the
//! only thing cleanup keys on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::types::{validate_step_specs, ExecutionInfraScope, InfraStatus, ResourceDefaults, StepSpec};
use crate::config::OrchestratorConfig;
use crate::dispatch::dispatcher::{TaskDispatcher, TaskRequest};
use crate::dispatch::types::{
    duration_millis, CleanupRequest, InfraSpec, InitRequest, LogConfig, TaskType,
};
use crate::error::{OrchestratorError, Phase, StoreError};
use crate::metrics::MetricsCollector;
use crate::step::outcome::{
    CommandExecutionStatus, FailureInfo, InitInfraResult, StepOutcome, TaskOutcome, TaskResponse,
};
use crate::store::types::{
    CallbackHandle, CorrelationContext, CorrelationEntry, Resolution, ResolveResult, StageScope,
    SweepingRecord, INFRA_OUTPUT_KEY, INFRA_SCOPE_KEY,
};
use crate::store::{CallbackCorrelationStore, SweepingOutputChannel};

/// Everything needed to provision the infra of one stage.
#[derive(Debug, Clone)]
pub struct InitInfraRequest {
    pub stage: StageScope,
    pub owner_execution_id: String,
    pub step_specs: Vec<StepSpec>,
    pub log_prefix: String,
    pub timeout: Duration,
    pub selectors: Vec<String>,
}

/// What a cleanup request did. Cleanup never fails the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReport {
    /// No infra output was recorded; nothing to clean up.
    NotRequired,
    Issued {
        infra_ref_id: String,
        task_id: String,
    },
    Failed {
        infra_ref_id: Option<String>,
        reason: String,
    },
}

/// Settled state of an Init handle.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSettlement {
    pub scope: ExecutionInfraScope,
    /// Outcome of the owning step, if this call recorded it.
    pub claimed: Option<StepOutcome>,
}

impl InitSettlement {
    /// The scope, or `InfraInitialization` if Init failed.
    pub fn into_result(self, callback_id: &str) -> Result<ExecutionInfraScope, OrchestratorError> {
        if self.scope.status == InfraStatus::Failed {
            return Err(OrchestratorError::InfraInitialization {
                task_id: callback_id.to_string(),
                infra_ref_id: self.scope.infra_ref_id,
                message: self.scope.failure.unwrap_or_default(),
            });
        }
        Ok(self.scope)
    }
}

/// Drives Init, publishes the infra reference id and tears the infra down.
pub struct InfraLifecycleController {
    dispatcher: Arc<TaskDispatcher>,
    correlations: Arc<dyn CallbackCorrelationStore>,
    outputs: Arc<dyn SweepingOutputChannel>,
    cleanup_timeout: Duration,
    resources: ResourceDefaults,
    log_service_url: Option<String>,
    metrics: MetricsCollector,
}

impl InfraLifecycleController {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        correlations: Arc<dyn CallbackCorrelationStore>,
        outputs: Arc<dyn SweepingOutputChannel>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            dispatcher,
            correlations,
            outputs,
            cleanup_timeout: config.cleanup_timeout,
            resources: config.resource_defaults(),
            log_service_url: config.log_service_url.clone(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Submits the Init task for a stage and records its callback handle.
    ///
    /// # Errors
    ///
    /// - `InvalidStep` if the step specs are not dispatchable or the stage already
    ///   has an infra scope (no remote call is made)
    /// - `Serialization` / `RemoteTransport` if submission fails; the scope
    ///   record is released so the stage can request Init again
    pub async fn initiate(
        &self,
        request: InitInfraRequest,
    ) -> Result<CallbackHandle, OrchestratorError> {
        validate_step_specs(&request.step_specs)?;

        let stage = request.stage.clone();
        let scope = ExecutionInfraScope::initializing(
            stage.clone(),
            request.owner_execution_id.clone(),
            request.step_specs.clone(),
            request.log_prefix.clone(),
        );
        if !self.write_scope(&scope).await? {
            return Err(OrchestratorError::InvalidStep(format!(
                "infrastructure for stage {} was already requested",
                stage.stage_execution_id
            )));
        }

        let params = InitRequest {
            account_id: stage.account.account_id.clone(),
            org_id: stage.account.org_id.clone(),
            project_id: stage.account.project_id.clone(),
            infra: InfraSpec {
                steps: request
                    .step_specs
                    .iter()
                    .map(|spec| spec.with_default_resources(&self.resources))
                    .collect(),
                log_config: LogConfig {
                    log_prefix: request.log_prefix.clone(),
                    log_service_url: self.log_service_url.clone(),
                },
            },
            selectors: request.selectors.clone(),
            execution_timeout_ms: duration_millis(request.timeout),
        };

        let task = TaskRequest::new(Phase::Init, TaskType::InitInfra, stage.account.clone())
            .with_timeout(request.timeout)
            .with_log_keys(vec![request.log_prefix.clone()])
            .with_selectors(request.selectors);

        let task_id = match self.dispatcher.submit(task, &params).await {
            Ok(task_id) => task_id,
            Err(e) => {
                self.release_scope(&stage).await;
                return Err(e);
            }
        };

        let handle = CallbackHandle::new(task_id, Phase::Init, TaskType::InitInfra);
        let entry = CorrelationEntry::new(
            handle.clone(),
            stage.clone(),
            CorrelationContext::Infra {
                owner_execution_id: request.owner_execution_id,
            },
            request.log_prefix,
        );
        self.correlations.put(&entry).await?;

        info!(
            callback_id = %handle.id,
            stage = %stage.stage_execution_id,
            steps = request.step_specs.len(),
            "Requested infrastructure"
        );

        self.replay_held_init(&handle.id).await;
        Ok(handle)
    }

    /// Applies the result of an Init task.
    ///
    /// On success the infra reference id is published exactly once and the
    /// scope becomes Ready. A duplicate delivery returns the settled scope
    /// without side effects.
    ///
    /// # Errors
    ///
    /// - `InfraInitialization` if the remote side reported failure; a partial
    ///   infra reference id is cleaned up best-effort
    /// - `UnknownCallback` if no Init handle is recorded under `callback_id`
    pub async fn on_init_callback(
        &self,
        callback_id: &str,
        result: InitInfraResult,
    ) -> Result<ExecutionInfraScope, OrchestratorError> {
        self.settle_init(callback_id, result)
            .await?
            .into_result(callback_id)
    }

    /// Applies the result of an Init task and claims the owning step's outcome.
    ///
    /// A redelivery for a handle whose first settlement was interrupted (the
    /// scope is still Initializing) finishes the settlement with the
    /// redelivered result.
    pub async fn settle_init(
        &self,
        callback_id: &str,
        result: InitInfraResult,
    ) -> Result<InitSettlement, OrchestratorError> {
        let response = TaskResponse::InitInfra(result.clone());
        let resolution = Resolution::from_response(&response);

        let (entry, scope) = match self.correlations.resolve(callback_id, &resolution).await? {
            ResolveResult::Applied(entry) => {
                check_init_phase(&entry, callback_id, &response)?;
                self.metrics
                    .record_callback(Phase::Init.as_str(), resolution.outcome.label());

                let scope = match self.scope(&entry.stage).await? {
                    Some(scope) => scope,
                    None => ExecutionInfraScope::initializing(
                        entry.stage.clone(),
                        owner_of(&entry),
                        Vec::new(),
                        entry.log_prefix.clone(),
                    ),
                };
                let scope = self.apply_init_result(&entry, callback_id, scope, result).await?;
                (entry, scope)
            }
            ResolveResult::AlreadyResolved(entry) => {
                check_init_phase(&entry, callback_id, &response)?;

                // Init finished after it was cancelled: nobody will use the infra
                let cancelled = entry.resolution.as_ref().is_some_and(|r| r.synthetic);
                if let Some(late_id) = result.infra_ref_id.as_deref().filter(|_| cancelled) {
                    if !late_id.trim().is_empty() {
                        warn!(callback_id = %callback_id, infra_ref_id = %late_id, "Init completed after cancellation, releasing infrastructure");
                        self.issue_cleanup(&entry.stage, late_id).await;
                    }
                }

                let Some(scope) = self.scope(&entry.stage).await? else {
                    return Err(OrchestratorError::InfraNotFound {
                        stage_execution_id: entry.stage.stage_execution_id.clone(),
                    });
                };

                let scope = if !cancelled && scope.status == InfraStatus::Initializing {
                    info!(callback_id = %callback_id, "Resuming interrupted init settlement");
                    self.apply_init_result(&entry, callback_id, scope, result).await?
                } else {
                    debug!(callback_id = %callback_id, "Ignoring duplicate init callback");
                    scope
                };
                (entry, scope)
            }
            ResolveResult::Unknown => {
                return Err(OrchestratorError::UnknownCallback(callback_id.to_string()))
            }
        };

        self.settlement(&entry, callback_id, scope).await
    }

    /// Publishes the infra of a successful Init, or records the failure.
    /// Returns the settled scope.
    async fn apply_init_result(
        &self,
        entry: &CorrelationEntry,
        callback_id: &str,
        scope: ExecutionInfraScope,
        result: InitInfraResult,
    ) -> Result<ExecutionInfraScope, OrchestratorError> {
        let infra_ref_id = result.infra_ref_id.filter(|id| !id.trim().is_empty());

        if result.status == CommandExecutionStatus::Success {
            if let Some(infra_ref_id) = infra_ref_id.clone() {
                let record = SweepingRecord::infra_output(entry.stage.clone(), infra_ref_id.clone());
                let published = if self.outputs.put(&record).await? {
                    infra_ref_id
                } else {
                    warn!(
                        stage = %entry.stage.stage_execution_id,
                        "Infrastructure output already recorded, keeping the first value"
                    );
                    self.infra_ref_id(&entry.stage).await?.unwrap_or(infra_ref_id)
                };

                let ready = scope.ready(published.clone());
                self.replace_scope(&ready).await?;
                info!(
                    callback_id = %callback_id,
                    infra_ref_id = %published,
                    "Infrastructure ready"
                );
                return Ok(ready);
            }
        }

        let message = match result.error_message.filter(|m| !m.trim().is_empty()) {
            Some(message) => message,
            None if result.status == CommandExecutionStatus::Success => {
                "init succeeded without an infrastructure reference id".to_string()
            }
            None => format!("init reported status {:?}", result.status),
        };

        let failed = scope.failed(infra_ref_id.clone(), message.clone());
        self.replace_scope(&failed).await?;
        warn!(
            callback_id = %callback_id,
            error = %message,
            "Infrastructure initialization failed"
        );

        if let Some(partial) = &infra_ref_id {
            self.issue_cleanup(&entry.stage, partial).await;
        }
        Ok(failed)
    }

    /// Claims the outcome of the step owning a settled Init handle.
    async fn settlement(
        &self,
        entry: &CorrelationEntry,
        callback_id: &str,
        scope: ExecutionInfraScope,
    ) -> Result<InitSettlement, OrchestratorError> {
        let owner = owner_of(entry);
        let outcome = match scope.status {
            InfraStatus::Initializing => None,
            InfraStatus::Ready | InfraStatus::CleanedUp => {
                Some(StepOutcome::succeeded(owner.clone(), BTreeMap::new()))
            }
            InfraStatus::Failed => Some(StepOutcome::failed(
                owner.clone(),
                FailureInfo {
                    phase: Phase::Init,
                    message: scope.failure.clone().unwrap_or_default(),
                    task_id: Some(callback_id.to_string()),
                    infra_ref_id: scope.infra_ref_id.clone(),
                    multi_task: false,
                },
            )),
        };

        let claimed = match outcome {
            Some(outcome) if self.correlations.claim_completion(&owner, &outcome).await? => {
                Some(outcome)
            }
            _ => None,
        };
        Ok(InitSettlement { scope, claimed })
    }

    /// Tears down the stage's infra if it was ever published.
    ///
    /// Safe to call any number of times and concurrently: the infra output is
    /// taken atomically, so at most one cleanup is issued per infra reference id.
    pub async fn request_cleanup(&self, stage: &StageScope) -> CleanupReport {
        let record = match self.outputs.take(stage, INFRA_OUTPUT_KEY).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(stage = %stage.stage_execution_id, "No infrastructure to clean up");
                return CleanupReport::NotRequired;
            }
            Err(e) => {
                warn!(stage = %stage.stage_execution_id, error = %e, "Failed to read infrastructure output");
                self.metrics.record_cleanup(false);
                return CleanupReport::Failed {
                    infra_ref_id: None,
                    reason: e.to_string(),
                };
            }
        };

        let report = self.issue_cleanup(stage, &record.value).await;

        match self.scope(stage).await {
            Ok(Some(scope)) if scope.status != InfraStatus::CleanedUp => {
                if let Err(e) = self.replace_scope(&scope.cleaned_up()).await {
                    warn!(stage = %stage.stage_execution_id, error = %e, "Failed to mark infrastructure cleaned up");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(stage = %stage.stage_execution_id, error = %e, "Failed to read infrastructure scope");
            }
        }

        report
    }

    /// Resolves an outstanding Init handle with a synthetic cancellation and
    /// cancels the remote task. Returns `false` if the handle had already resolved.
    pub async fn cancel_init(
        &self,
        callback_id: &str,
        reason: &str,
    ) -> Result<bool, OrchestratorError> {
        let entry = match self
            .correlations
            .resolve(callback_id, &Resolution::synthetic_cancel(reason))
            .await?
        {
            ResolveResult::Applied(entry) => entry,
            ResolveResult::AlreadyResolved(_) => return Ok(false),
            ResolveResult::Unknown => {
                return Err(OrchestratorError::UnknownCallback(callback_id.to_string()))
            }
        };

        self.metrics.record_callback(Phase::Init.as_str(), "cancelled");

        if let Some(scope) = self.scope(&entry.stage).await? {
            if scope.status == InfraStatus::Initializing {
                self.replace_scope(&scope.failed(None, reason)).await?;
            }
        }

        if let Err(e) = self
            .dispatcher
            .cancel(Phase::Init, &entry.stage.account.account_id, callback_id)
            .await
        {
            warn!(callback_id = %callback_id, error = %e, "Failed to cancel init task");
        }

        info!(callback_id = %callback_id, reason = %reason, "Cancelled infrastructure initialization");
        Ok(true)
    }

    /// Consumes the callback of a Cleanup task. Returns the infra reference id
    /// it was issued for, or `None` for an unknown id.
    pub async fn acknowledge_cleanup(
        &self,
        callback_id: &str,
        response: &TaskResponse,
    ) -> Result<Option<String>, OrchestratorError> {
        let Some(entry) = self.correlations.get_optional(callback_id).await? else {
            return Ok(None);
        };
        let CorrelationContext::Cleanup { infra_ref_id } = entry.context else {
            return Err(OrchestratorError::UnexpectedResponse {
                phase: entry.handle.phase,
                callback_id: callback_id.to_string(),
                detail: "cleanup acknowledgement for a non-cleanup task".to_string(),
            });
        };

        let outcome = response.outcome();
        self.metrics
            .record_callback(Phase::Cleanup.as_str(), outcome.label());
        match outcome {
            TaskOutcome::Success(_) => {
                info!(callback_id = %callback_id, infra_ref_id = %infra_ref_id, "Infrastructure cleaned up");
            }
            other => {
                warn!(
                    callback_id = %callback_id,
                    infra_ref_id = %infra_ref_id,
                    outcome = ?other,
                    "Cleanup task did not succeed"
                );
            }
        }

        self.correlations.remove(callback_id).await?;
        Ok(Some(infra_ref_id))
    }

    /// Infra reference id published for the stage, if Init has succeeded.
    pub async fn infra_ref_id(&self, stage: &StageScope) -> Result<Option<String>, OrchestratorError> {
        Ok(self
            .outputs
            .get_optional(stage, INFRA_OUTPUT_KEY)
            .await?
            .map(|record| record.value))
    }

    pub async fn scope(
        &self,
        stage: &StageScope,
    ) -> Result<Option<ExecutionInfraScope>, OrchestratorError> {
        let Some(record) = self.outputs.get_optional(stage, INFRA_SCOPE_KEY).await? else {
            return Ok(None);
        };
        let scope = serde_json::from_str(&record.value).map_err(StoreError::from)?;
        Ok(Some(scope))
    }

    async fn issue_cleanup(&self, stage: &StageScope, infra_ref_id: &str) -> CleanupReport {
        let params = CleanupRequest {
            account_id: stage.account.account_id.clone(),
            infra_ref_id: infra_ref_id.to_string(),
        };
        let task = TaskRequest::new(Phase::Cleanup, TaskType::CleanupInfra, stage.account.clone())
            .with_timeout(self.cleanup_timeout);

        match self.dispatcher.submit(task, &params).await {
            Ok(task_id) => {
                let entry = CorrelationEntry::new(
                    CallbackHandle::new(task_id.clone(), Phase::Cleanup, TaskType::CleanupInfra),
                    stage.clone(),
                    CorrelationContext::Cleanup {
                        infra_ref_id: infra_ref_id.to_string(),
                    },
                    stage.storage_key(),
                );
                match self.correlations.put(&entry).await {
                    Ok(()) => self.replay_held_cleanup(&task_id).await,
                    Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record cleanup task"),
                }

                self.metrics.record_cleanup(true);
                info!(infra_ref_id = %infra_ref_id, task_id = %task_id, "Requested infrastructure cleanup");
                CleanupReport::Issued {
                    infra_ref_id: infra_ref_id.to_string(),
                    task_id,
                }
            }
            Err(e) => {
                self.metrics.record_cleanup(false);
                warn!(infra_ref_id = %infra_ref_id, error = %e, "Infrastructure cleanup failed");
                CleanupReport::Failed {
                    infra_ref_id: Some(infra_ref_id.to_string()),
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn write_scope(&self, scope: &ExecutionInfraScope) -> Result<bool, OrchestratorError> {
        let value = serde_json::to_string(scope).map_err(StoreError::from)?;
        let record = SweepingRecord::new(scope.stage.clone(), INFRA_SCOPE_KEY, value);
        Ok(self.outputs.put(&record).await?)
    }

    /// Overwrites the scope record in place, so it is never absent.
    async fn replace_scope(&self, scope: &ExecutionInfraScope) -> Result<(), OrchestratorError> {
        let value = serde_json::to_string(scope).map_err(StoreError::from)?;
        let record = SweepingRecord::new(scope.stage.clone(), INFRA_SCOPE_KEY, value);
        self.outputs.replace(&record).await?;
        Ok(())
    }

    /// Applies an Init response delivered before the handle was recorded.
    async fn replay_held_init(&self, callback_id: &str) {
        let response = match self.correlations.take_held_delivery(callback_id).await {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => {
                warn!(callback_id = %callback_id, error = %e, "Failed to read held init callback");
                return;
            }
        };

        let result = match response.into_init_result() {
            Ok(result) => result,
            Err(other) => {
                warn!(callback_id = %callback_id, response = other.kind(), "Dropping held non-init response for init task");
                return;
            }
        };

        info!(callback_id = %callback_id, "Applying init callback delivered before its handle was recorded");
        if let Err(e) = self.settle_init(callback_id, result).await {
            warn!(callback_id = %callback_id, error = %e, "Failed to apply held init callback");
        }
    }

    async fn replay_held_cleanup(&self, callback_id: &str) {
        match self.correlations.take_held_delivery(callback_id).await {
            Ok(Some(response)) => {
                if let Err(e) = self.acknowledge_cleanup(callback_id, &response).await {
                    warn!(callback_id = %callback_id, error = %e, "Failed to apply held cleanup callback");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(callback_id = %callback_id, error = %e, "Failed to read held cleanup callback");
            }
        }
    }

    async fn release_scope(&self, stage: &StageScope) {
        if let Err(e) = self.outputs.take(stage, INFRA_SCOPE_KEY).await {
            warn!(stage = %stage.stage_execution_id, error = %e, "Failed to release infrastructure scope");
        }
    }
}

fn check_init_phase(
    entry: &CorrelationEntry,
    callback_id: &str,
    response: &TaskResponse,
) -> Result<(), OrchestratorError> {
    if entry.handle.phase != Phase::Init {
        return Err(OrchestratorError::UnexpectedResponse {
            phase: entry.handle.phase,
            callback_id: callback_id.to_string(),
            detail: format!("{} response for a non-init task", response.kind()),
        });
    }
    Ok(())
}

fn owner_of(entry: &CorrelationEntry) -> String {
    match &entry.context {
        CorrelationContext::Infra { owner_execution_id } => owner_execution_id.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::codec::decode_envelope;
    use crate::step::outcome::Status;
    use crate::test_support::{run_spec, stage, FakeDispatchClient, MemoryStore};

    fn controller(client: Arc<FakeDispatchClient>, store: Arc<MemoryStore>) -> InfraLifecycleController {
        let config = OrchestratorConfig::default();
        let dispatcher = Arc::new(TaskDispatcher::new(client, &config));
        InfraLifecycleController::new(dispatcher, store.clone(), store, &config)
    }

    fn request(specs: Vec<StepSpec>) -> InitInfraRequest {
        InitInfraRequest {
            stage: stage(),
            owner_execution_id: "init-exec-1".to_string(),
            step_specs: specs,
            log_prefix: "logs/stage-1".to_string(),
            timeout: Duration::from_secs(600),
            selectors: vec!["k8s".to_string()],
        }
    }

    #[tokio::test]
    async fn test_initiate_records_handle_and_submits_init() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();

        assert_eq!(handle.phase, Phase::Init);
        let entry = store.entry(&handle.id).unwrap();
        assert!(!entry.is_resolved());

        let submitted = client.submissions_of(TaskType::InitInfra);
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].descriptor.selectors, vec!["k8s".to_string()]);
        let params: InitRequest = decode_envelope(&submitted[0].descriptor.parameters.bytes).unwrap();
        assert_eq!(params.execution_timeout_ms, 600_000);
        // Defaults applied to a spec without resources
        assert_eq!(params.infra.steps[0].resources.cpu.as_deref(), Some("100m"));
        assert_eq!(params.infra.steps[0].resources.memory.as_deref(), Some("100Mi"));

        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::Initializing);
    }

    #[tokio::test]
    async fn test_initiate_rejects_invalid_specs_without_remote_call() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store);

        let err = infra.initiate(request(Vec::new())).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidStep(_)));

        let duplicate = vec![run_spec("build"), run_spec("build")];
        let err = infra.initiate(request(duplicate)).await.unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));

        assert!(client.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_second_initiate_for_stage_is_rejected() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store);

        infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        let err = infra.initiate(request(vec![run_spec("build")])).await.unwrap_err();

        assert!(err.to_string().contains("already requested"));
        assert_eq!(client.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_failure_releases_scope() {
        let client = Arc::new(FakeDispatchClient::new());
        client.fail_submissions_of(TaskType::InitInfra, "no eligible delegates");
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store);

        let err = infra.initiate(request(vec![run_spec("build")])).await.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Init));
        assert!(err.to_string().contains("no eligible delegates"));
        assert!(infra.scope(&stage()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_successful_init_writes_output_exactly_once() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client, store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        let scope = infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();

        assert_eq!(scope.status, InfraStatus::Ready);
        assert_eq!(scope.infra_ref_id.as_deref(), Some("infra-1"));
        assert_eq!(store.writes_of(INFRA_OUTPUT_KEY), 1);

        // Duplicate delivery changes nothing
        let again = infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-2"))
            .await
            .unwrap();
        assert_eq!(again.infra_ref_id.as_deref(), Some("infra-1"));
        assert_eq!(store.writes_of(INFRA_OUTPUT_KEY), 1);
        assert_eq!(
            infra.infra_ref_id(&stage()).await.unwrap().as_deref(),
            Some("infra-1")
        );
    }

    #[tokio::test]
    async fn test_failed_init_never_writes_output() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        let err = infra
            .on_init_callback(&handle.id, InitInfraResult::failure("quota exceeded"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(store.writes_of(INFRA_OUTPUT_KEY), 0);
        assert!(client.submissions_of(TaskType::CleanupInfra).is_empty());

        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_init_cleans_up_partial_infra() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store);

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        let result = InitInfraResult {
            status: CommandExecutionStatus::Failure,
            infra_ref_id: Some("infra-partial".to_string()),
            error_message: Some("image pull failed".to_string()),
        };
        let err = infra.on_init_callback(&handle.id, result).await.unwrap_err();

        match err {
            OrchestratorError::InfraInitialization { infra_ref_id, .. } => {
                assert_eq!(infra_ref_id.as_deref(), Some("infra-partial"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let cleanups = client.submissions_of(TaskType::CleanupInfra);
        assert_eq!(cleanups.len(), 1);
        let params: CleanupRequest = decode_envelope(&cleanups[0].descriptor.parameters.bytes).unwrap();
        assert_eq!(params.infra_ref_id, "infra-partial");
    }

    #[tokio::test]
    async fn test_unknown_init_callback() {
        let infra = controller(Arc::new(FakeDispatchClient::new()), Arc::new(MemoryStore::new()));
        let err = infra
            .on_init_callback("missing", InitInfraResult::success("infra-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownCallback(_)));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        assert_eq!(infra.request_cleanup(&stage()).await, CleanupReport::NotRequired);

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();

        let first = infra.request_cleanup(&stage()).await;
        let second = infra.request_cleanup(&stage()).await;

        assert!(matches!(first, CleanupReport::Issued { ref infra_ref_id, .. } if infra_ref_id == "infra-1"));
        assert_eq!(second, CleanupReport::NotRequired);

        let cleanups = client.submissions_of(TaskType::CleanupInfra);
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].descriptor.execution_timeout_ms, 600_000);
        // The id read by cleanup is the one Init wrote
        let params: CleanupRequest = decode_envelope(&cleanups[0].descriptor.parameters.bytes).unwrap();
        assert_eq!(params.infra_ref_id, "infra-1");
        assert_eq!(params.account_id, "acct");

        assert!(store.sweeping_value(&stage(), INFRA_OUTPUT_KEY).is_none());
        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::CleanedUp);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported_not_raised() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store);

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();

        client.fail_submissions_of(TaskType::CleanupInfra, "delegate unavailable");
        let report = infra.request_cleanup(&stage()).await;

        assert!(matches!(report, CleanupReport::Failed { ref reason, .. } if reason.contains("delegate unavailable")));
    }

    #[tokio::test]
    async fn test_cancel_init_resolves_handle_once() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        assert!(infra.cancel_init(&handle.id, "Step aborted").await.unwrap());
        assert!(!infra.cancel_init(&handle.id, "Step aborted").await.unwrap());

        assert_eq!(client.cancels(), vec![handle.id.clone()]);
        assert!(store.entry(&handle.id).unwrap().is_resolved());
        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::Failed);
    }

    #[tokio::test]
    async fn test_late_init_success_after_cancel_is_released() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        infra.cancel_init(&handle.id, "Step aborted").await.unwrap();

        let err = infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-late"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InfraInitialization { .. }));
        assert_eq!(store.writes_of(INFRA_OUTPUT_KEY), 0);

        let cleanups = client.submissions_of(TaskType::CleanupInfra);
        assert_eq!(cleanups.len(), 1);
        let params: CleanupRequest = decode_envelope(&cleanups[0].descriptor.parameters.bytes).unwrap();
        assert_eq!(params.infra_ref_id, "infra-late");
    }

    #[tokio::test]
    async fn test_acknowledge_cleanup_removes_entry() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();
        let CleanupReport::Issued { task_id, .. } = infra.request_cleanup(&stage()).await else {
            panic!("cleanup not issued");
        };

        let acknowledged = infra
            .acknowledge_cleanup(&task_id, &TaskResponse::Acknowledged)
            .await
            .unwrap();
        assert_eq!(acknowledged.as_deref(), Some("infra-1"));
        assert!(store.entry(&task_id).is_none());
    }

    #[tokio::test]
    async fn test_scope_transitions_overwrite_in_place() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client.clone(), store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();

        // The scope record was never absent, so it kept guarding the stage
        assert_eq!(store.takes_of(INFRA_SCOPE_KEY), 0);
        let err = infra.initiate(request(vec![run_spec("build")])).await.unwrap_err();
        assert!(err.to_string().contains("already requested"));
        assert_eq!(client.submissions_of(TaskType::InitInfra).len(), 1);
        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::Ready);
    }

    #[tokio::test]
    async fn test_init_redelivery_finishes_interrupted_settlement() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client, store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        store.fail_next("replace");
        let err = infra
            .on_init_callback(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert!(store.entry(&handle.id).unwrap().is_resolved());
        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::Initializing);

        let settlement = infra
            .settle_init(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();
        assert_eq!(settlement.scope.status, InfraStatus::Ready);
        assert_eq!(settlement.scope.infra_ref_id.as_deref(), Some("infra-1"));
        assert_eq!(settlement.claimed.map(|o| o.status), Some(Status::Succeeded));
        assert_eq!(store.writes_of(INFRA_OUTPUT_KEY), 1);

        // Settled now, so a further delivery claims nothing
        let again = infra
            .settle_init(&handle.id, InitInfraResult::success("infra-1"))
            .await
            .unwrap();
        assert!(again.claimed.is_none());
    }

    #[tokio::test]
    async fn test_failed_settlement_claims_failed_outcome() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client, store.clone());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        let settlement = infra
            .settle_init(&handle.id, InitInfraResult::failure("quota exceeded"))
            .await
            .unwrap();

        let outcome = settlement.claimed.clone().unwrap();
        assert_eq!(outcome.step_id, "init-exec-1");
        assert_eq!(outcome.status, Status::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.phase, Phase::Init);
        assert_eq!(failure.task_id.as_deref(), Some(handle.id.as_str()));
        assert_eq!(
            store.completed_outcome("init-exec-1").await.unwrap().map(|o| o.status),
            Some(Status::Failed)
        );
        assert!(matches!(
            settlement.into_result(&handle.id),
            Err(OrchestratorError::InfraInitialization { ref message, .. }) if message == "quota exceeded"
        ));
    }

    #[tokio::test]
    async fn test_init_callback_held_before_handle_is_applied() {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let infra = controller(client, store.clone());

        // The fake hands out "task-1" to the first submission
        let early = TaskResponse::InitInfra(InitInfraResult::success("infra-1"));
        assert!(store.hold_delivery("task-1", &early).await.unwrap());

        let handle = infra.initiate(request(vec![run_spec("build")])).await.unwrap();
        assert_eq!(handle.id, "task-1");
        assert!(store.held("task-1").is_none());

        let scope = infra.scope(&stage()).await.unwrap().unwrap();
        assert_eq!(scope.status, InfraStatus::Ready);
        assert_eq!(
            infra.infra_ref_id(&stage()).await.unwrap().as_deref(),
            Some("infra-1")
        );
        assert_eq!(
            store.completed_outcome("init-exec-1").await.unwrap().map(|o| o.status),
            Some(Status::Succeeded)
        );
    }
}
