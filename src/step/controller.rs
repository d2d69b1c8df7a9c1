//! Asynchronous execution of one step against the delegate fleet.
//!
//! A step issues one task (single-task mode) or a parked placeholder plus a
//! lite-engine task (dual-task mode). Every task gets a correlation entry that
//! names all of its siblings, so any process can resume the step from a
//! delivered callback. The step completes once every sibling has resolved;
//! completion is claimed in the store so exactly one outcome is produced.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::outcome::{
    derive_outcome, SiblingAbortPolicy, Status, StepOutcome, TaskOutcome, TaskResponse,
    SIBLING_ABORT_MESSAGE,
};
use super::timeout::TimeoutBudget;
use crate::config::{DispatchMode, OrchestratorConfig};
use crate::dispatch::dispatcher::{TaskDispatcher, TaskRequest};
use crate::dispatch::types::{
    duration_millis, ExecuteRequest, LiteEngineParams, ParkedTaskParams, TaskType,
};
use crate::error::{OrchestratorError, Phase};
use crate::infra::lifecycle::{CleanupReport, InfraLifecycleController};
use crate::infra::types::{ResourceDefaults, StepSpec};
use crate::metrics::MetricsCollector;
use crate::store::types::{
    CallbackHandle, CorrelationContext, CorrelationEntry, Resolution, ResolveResult, StageScope,
    INFRA_OUTPUT_KEY,
};
use crate::store::{CallbackCorrelationStore, SweepingOutputChannel};

/// One execution of one step.
#[derive(Debug, Clone)]
pub struct StepExecutionRequest {
    pub stage: StageScope,
    pub step_execution_id: String,
    pub spec: StepSpec,
    pub declared_timeout: Duration,
    /// When the enclosing step group started, if known.
    pub group_started_at: Option<DateTime<Utc>>,
    pub log_prefix: String,
    pub selectors: Vec<String>,
    /// The step is the last user of the stage's infra.
    pub release_infra: bool,
}

/// Handles and log keys of a dispatched step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<String>,
    pub log_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredReason {
    /// The handle had already resolved.
    Duplicate,
    /// Another delivery already produced the step's outcome.
    AlreadyCompleted,
}

/// Effect of one callback delivery on its step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepProgress {
    Pending { outstanding: usize },
    Completed(StepOutcome),
    Ignored(IgnoredReason),
}

/// Result of force-cancelling a step's outstanding handles.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelReport {
    pub cancelled: Vec<String>,
    pub outcome: Option<StepOutcome>,
}

/// Dispatches steps and reduces their task callbacks to one outcome.
pub struct StepExecutionController {
    dispatcher: Arc<TaskDispatcher>,
    correlations: Arc<dyn CallbackCorrelationStore>,
    outputs: Arc<dyn SweepingOutputChannel>,
    infra: Arc<InfraLifecycleController>,
    mode: DispatchMode,
    budget: TimeoutBudget,
    abort_policy: SiblingAbortPolicy,
    resources: ResourceDefaults,
    metrics: MetricsCollector,
}

impl StepExecutionController {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        correlations: Arc<dyn CallbackCorrelationStore>,
        outputs: Arc<dyn SweepingOutputChannel>,
        infra: Arc<InfraLifecycleController>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            dispatcher,
            correlations,
            outputs,
            infra,
            mode: config.dispatch_mode,
            budget: TimeoutBudget::new(config.min_dispatch_timeout, config.default_group_elapsed),
            abort_policy: SiblingAbortPolicy::default(),
            resources: config.resource_defaults(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the predicate deciding which outcomes cancel sibling tasks.
    pub fn with_abort_policy(mut self, policy: SiblingAbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Dispatches the step's task(s) and records their handles.
    ///
    /// # Errors
    ///
    /// - `InvalidStep` if the step is not dispatchable
    /// - `InfraNotFound` in single-task mode when the stage has no infra
    ///   output yet (no remote call is made)
    /// - `Serialization` / `RemoteTransport` if a submission fails
    pub async fn execute(
        &self,
        request: StepExecutionRequest,
    ) -> Result<AsyncExecutableResponse, OrchestratorError> {
        request.spec.validate()?;

        let timeout = self.budget.remaining(
            request.declared_timeout,
            request.group_started_at,
            Utc::now(),
        );
        let log_key = format!("{}/{}", request.log_prefix, request.spec.step_id);

        let handles = match self.mode {
            DispatchMode::SingleTask => {
                vec![self.submit_single(&request, timeout, &log_key).await?]
            }
            DispatchMode::DualTask => self.submit_dual(&request, timeout, &log_key).await?,
        };

        let siblings: Vec<String> = handles.iter().map(|h| h.id.clone()).collect();
        for handle in handles {
            let entry = CorrelationEntry::new(
                handle,
                request.stage.clone(),
                CorrelationContext::Step {
                    step_id: request.spec.step_id.clone(),
                    step_execution_id: request.step_execution_id.clone(),
                    siblings: siblings.clone(),
                    release_infra: request.release_infra,
                },
                request.log_prefix.clone(),
            );
            self.correlations.put(&entry).await?;
        }

        info!(
            step_id = %request.spec.step_id,
            step_execution_id = %request.step_execution_id,
            callback_ids = ?siblings,
            timeout_ms = duration_millis(timeout),
            "Dispatched step"
        );

        for id in &siblings {
            self.replay_held(id).await;
        }

        Ok(AsyncExecutableResponse {
            callback_ids: siblings,
            log_keys: vec![log_key],
        })
    }

    /// Applies one task response to its step.
    ///
    /// A response the abort policy treats as terminal failure resolves every
    /// other outstanding sibling with a synthetic cancellation before this
    /// call returns, and a best-effort remote cancel is sent for each sibling
    /// that has not failed. A step that completes unsuccessfully, or that was
    /// dispatched as the last user of its infra, has the infra released.
    ///
    /// A redelivery for a handle that already resolved finishes any follow-up
    /// work an interrupted earlier delivery left undone.
    pub async fn on_callback(
        &self,
        callback_id: &str,
        response: TaskResponse,
    ) -> Result<StepProgress, OrchestratorError> {
        let resolution = Resolution::from_response(&response);

        let entry = match self.correlations.resolve(callback_id, &resolution).await? {
            ResolveResult::Applied(entry) => entry,
            ResolveResult::AlreadyResolved(entry) => {
                check_step_context(&entry, callback_id, &response)?;
                return self.resume(&entry).await;
            }
            ResolveResult::Unknown => {
                return Err(OrchestratorError::UnknownCallback(callback_id.to_string()))
            }
        };
        check_step_context(&entry, callback_id, &response)?;

        self.metrics
            .record_callback(Phase::Execute.as_str(), resolution.outcome.label());
        debug!(
            callback_id = %callback_id,
            response = response.kind(),
            outcome = resolution.outcome.label(),
            "Step task resolved"
        );

        self.follow_up(&entry, &resolution).await
    }

    /// Resolves the given step handles with a synthetic cancellation and
    /// completes their step.
    pub async fn cancel_outstanding(
        &self,
        callback_ids: &[String],
        reason: &str,
    ) -> Result<CancelReport, OrchestratorError> {
        let mut step_entry = None;
        for id in callback_ids {
            if let Some(entry) = self.correlations.get_optional(id).await? {
                if matches!(entry.context, CorrelationContext::Step { .. }) {
                    step_entry = Some(entry);
                    break;
                }
            }
        }
        let Some(entry) = step_entry else {
            return Ok(CancelReport {
                cancelled: Vec::new(),
                outcome: None,
            });
        };

        let cancelled = self
            .cancel_handles(&entry.stage, callback_ids, reason, false)
            .await?;

        let outcome = match self.try_complete(&entry).await? {
            StepProgress::Completed(outcome) => Some(outcome),
            _ => match &entry.context {
                CorrelationContext::Step {
                    step_execution_id, ..
                } => self.correlations.completed_outcome(step_execution_id).await?,
                _ => None,
            },
        };

        Ok(CancelReport { cancelled, outcome })
    }

    /// Outcome of a step execution, once produced.
    pub async fn outcome(
        &self,
        step_execution_id: &str,
    ) -> Result<Option<StepOutcome>, OrchestratorError> {
        Ok(self.correlations.completed_outcome(step_execution_id).await?)
    }

    async fn submit_single(
        &self,
        request: &StepExecutionRequest,
        timeout: Duration,
        log_key: &str,
    ) -> Result<CallbackHandle, OrchestratorError> {
        let Some(record) = self
            .outputs
            .get_optional(&request.stage, INFRA_OUTPUT_KEY)
            .await?
        else {
            return Err(OrchestratorError::InfraNotFound {
                stage_execution_id: request.stage.stage_execution_id.clone(),
            });
        };

        let spec = request.spec.with_default_resources(&self.resources);
        let params = ExecuteRequest {
            infra_ref_id: record.value,
            step_id: spec.step_id.clone(),
            entrypoint: spec.entrypoint(),
            env: spec.container_env(),
            env_var_outputs: spec.output_variables.clone(),
            execution_timeout_ms: duration_millis(timeout),
        };

        let task = TaskRequest::new(Phase::Execute, TaskType::ExecuteStep, request.stage.account.clone())
            .with_timeout(timeout)
            .with_log_keys(vec![log_key.to_string()])
            .with_selectors(request.selectors.clone());
        let task_id = self.dispatcher.submit(task, &params).await?;

        Ok(CallbackHandle::new(task_id, Phase::Execute, TaskType::ExecuteStep))
    }

    async fn submit_dual(
        &self,
        request: &StepExecutionRequest,
        timeout: Duration,
        log_key: &str,
    ) -> Result<Vec<CallbackHandle>, OrchestratorError> {
        let account = request.stage.account.clone();

        let parked_params = ParkedTaskParams {
            step_id: request.spec.step_id.clone(),
            log_key: log_key.to_string(),
        };
        let parked = TaskRequest::new(Phase::Execute, TaskType::ParkedStatus, account.clone())
            .with_timeout(timeout)
            .with_log_keys(vec![log_key.to_string()])
            .with_selectors(request.selectors.clone())
            .parked();
        let parked_id = self.dispatcher.submit(parked, &parked_params).await?;

        let engine_params = LiteEngineParams {
            parked_task_id: parked_id.clone(),
            step: request.spec.with_default_resources(&self.resources),
            log_key: log_key.to_string(),
            execution_timeout_ms: duration_millis(timeout),
        };
        let engine = TaskRequest::new(Phase::Execute, TaskType::LiteEngine, account.clone())
            .with_timeout(timeout)
            .with_log_keys(vec![log_key.to_string()])
            .with_selectors(request.selectors.clone());

        let engine_id = match self.dispatcher.submit(engine, &engine_params).await {
            Ok(task_id) => task_id,
            Err(e) => {
                // The parked task would otherwise hold delegate capacity until it times out
                if let Err(cancel_err) = self
                    .dispatcher
                    .cancel(Phase::Execute, &account.account_id, &parked_id)
                    .await
                {
                    warn!(task_id = %parked_id, error = %cancel_err, "Failed to cancel parked task");
                }
                return Err(e);
            }
        };

        Ok(vec![
            CallbackHandle::new(parked_id, Phase::Execute, TaskType::ParkedStatus),
            CallbackHandle::new(engine_id, Phase::Execute, TaskType::LiteEngine),
        ])
    }

    /// Resolves each handle with a synthetic cancellation, then cancels the
    /// remote tasks of the handles this call resolved. With
    /// `include_succeeded`, handles that already resolved with a real success
    /// are cancelled remotely too. Returns the handles this call resolved.
    async fn cancel_handles(
        &self,
        stage: &StageScope,
        callback_ids: &[String],
        reason: &str,
        include_succeeded: bool,
    ) -> Result<Vec<String>, OrchestratorError> {
        let resolution = Resolution::synthetic_cancel(reason);
        let mut cancelled = Vec::new();
        let mut remote = Vec::new();
        for id in callback_ids {
            match self.correlations.resolve(id, &resolution).await? {
                ResolveResult::Applied(_) => {
                    self.metrics
                        .record_callback(Phase::Execute.as_str(), resolution.outcome.label());
                    cancelled.push(id.clone());
                    remote.push(id.clone());
                }
                ResolveResult::AlreadyResolved(entry) if include_succeeded => {
                    let succeeded = entry.resolution.as_ref().is_some_and(|r| {
                        !r.synthetic && matches!(r.outcome, TaskOutcome::Success(_))
                    });
                    if succeeded {
                        remote.push(id.clone());
                    }
                }
                _ => {}
            }
        }

        let account_id = stage.account.account_id.as_str();
        let results = join_all(
            remote
                .iter()
                .map(|id| self.dispatcher.cancel(Phase::Execute, account_id, id)),
        )
        .await;
        for (id, result) in remote.iter().zip(results) {
            if let Err(e) = result {
                warn!(task_id = %id, error = %e, "Failed to cancel task");
            }
        }

        Ok(cancelled)
    }

    /// Cancels siblings if the resolution calls for it, then tries to complete
    /// the step.
    async fn follow_up(
        &self,
        entry: &CorrelationEntry,
        resolution: &Resolution,
    ) -> Result<StepProgress, OrchestratorError> {
        let CorrelationContext::Step { siblings, .. } = &entry.context else {
            return Ok(StepProgress::Ignored(IgnoredReason::Duplicate));
        };
        let callback_id = entry.handle.id.as_str();

        if !resolution.synthetic && self.abort_policy.should_abort_siblings(&resolution.outcome) {
            let others: Vec<String> = siblings
                .iter()
                .filter(|id| id.as_str() != callback_id)
                .cloned()
                .collect();
            let cancelled = self
                .cancel_handles(&entry.stage, &others, SIBLING_ABORT_MESSAGE, true)
                .await?;
            if !cancelled.is_empty() {
                self.metrics.record_sibling_abort(cancelled.len());
                warn!(
                    callback_id = %callback_id,
                    cancelled = ?cancelled,
                    "Task failed, cancelled sibling tasks"
                );
            }
        }

        let progress = self.try_complete(entry).await?;
        if let StepProgress::Completed(outcome) = &progress {
            self.release_if_needed(entry, outcome).await;
        }
        Ok(progress)
    }

    /// Handles a delivery for a handle that had already resolved.
    async fn resume(&self, entry: &CorrelationEntry) -> Result<StepProgress, OrchestratorError> {
        let CorrelationContext::Step {
            step_execution_id, ..
        } = &entry.context
        else {
            return Ok(StepProgress::Ignored(IgnoredReason::Duplicate));
        };

        if let Some(outcome) = self.correlations.completed_outcome(step_execution_id).await? {
            debug!(callback_id = %entry.handle.id, "Ignoring callback for a completed step");
            // Cleanup takes the infra output atomically, so repeating it is harmless
            self.release_if_needed(entry, &outcome).await;
            return Ok(StepProgress::Ignored(IgnoredReason::AlreadyCompleted));
        }

        let Some(resolution) = entry.resolution.clone() else {
            return Ok(StepProgress::Ignored(IgnoredReason::Duplicate));
        };
        match self.follow_up(entry, &resolution).await? {
            StepProgress::Pending { .. } => {
                debug!(callback_id = %entry.handle.id, "Ignoring duplicate step callback");
                Ok(StepProgress::Ignored(IgnoredReason::Duplicate))
            }
            progress => Ok(progress),
        }
    }

    async fn try_complete(&self, entry: &CorrelationEntry) -> Result<StepProgress, OrchestratorError> {
        let CorrelationContext::Step {
            step_id,
            step_execution_id,
            siblings,
            ..
        } = &entry.context
        else {
            return Ok(StepProgress::Ignored(IgnoredReason::Duplicate));
        };

        let mut resolutions = Vec::with_capacity(siblings.len());
        let mut outstanding = 0;
        for id in siblings {
            match self.correlations.get_optional(id).await? {
                Some(CorrelationEntry {
                    resolution: Some(resolution),
                    ..
                }) => resolutions.push((id.clone(), resolution)),
                _ => outstanding += 1,
            }
        }

        if outstanding > 0 {
            return Ok(StepProgress::Pending { outstanding });
        }

        let outcome = derive_outcome(step_id, &resolutions);

        if !self
            .correlations
            .claim_completion(step_execution_id, &outcome)
            .await?
        {
            return Ok(StepProgress::Ignored(IgnoredReason::AlreadyCompleted));
        }

        self.metrics.record_step_outcome(outcome.status.as_str());
        info!(
            step_id = %step_id,
            step_execution_id = %step_execution_id,
            status = %outcome.status,
            "Step completed"
        );
        Ok(StepProgress::Completed(outcome))
    }

    /// Releases the stage's infra after an unsuccessful step or its last user.
    async fn release_if_needed(&self, entry: &CorrelationEntry, outcome: &StepOutcome) {
        let CorrelationContext::Step { release_infra, .. } = &entry.context else {
            return;
        };
        let finished_cleanly = matches!(outcome.status, Status::Succeeded | Status::Skipped);
        if finished_cleanly && !*release_infra {
            return;
        }

        match self.infra.request_cleanup(&entry.stage).await {
            CleanupReport::Failed { infra_ref_id, reason } => {
                warn!(
                    step_id = %outcome.step_id,
                    infra_ref_id = ?infra_ref_id,
                    reason = %reason,
                    "Cleanup after step failed"
                );
            }
            CleanupReport::NotRequired => {}
            report => {
                info!(step_id = %outcome.step_id, report = ?report, "Released infrastructure after step");
            }
        }
    }

    /// Applies a response delivered before its handle was recorded.
    async fn replay_held(&self, callback_id: &str) {
        match self.correlations.take_held_delivery(callback_id).await {
            Ok(Some(response)) => {
                info!(callback_id = %callback_id, "Applying step callback delivered before its handle was recorded");
                if let Err(e) = self.on_callback(callback_id, response).await {
                    warn!(callback_id = %callback_id, error = %e, "Failed to apply held step callback");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(callback_id = %callback_id, error = %e, "Failed to read held step callback");
            }
        }
    }
}

fn check_step_context(
    entry: &CorrelationEntry,
    callback_id: &str,
    response: &TaskResponse,
) -> Result<(), OrchestratorError> {
    if !matches!(entry.context, CorrelationContext::Step { .. }) {
        return Err(OrchestratorError::UnexpectedResponse {
            phase: entry.handle.phase,
            callback_id: callback_id.to_string(),
            detail: format!("{} response for a non-step task", response.kind()),
        });
    }
    Ok(())
}
