//! External abort of a running step.
//!
//! An abort releases the stage's infra without waiting for the cleanup task
//! and resolves every outstanding handle of the step with a synthetic
//! cancellation, so nothing is left waiting on a callback that may never come.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Phase};
use crate::infra::lifecycle::{CleanupReport, InfraLifecycleController};
use crate::step::controller::StepExecutionController;
use crate::step::outcome::{FailureInfo, StepOutcome, ABORT_MESSAGE};
use crate::store::types::{CorrelationContext, StageScope};
use crate::store::CallbackCorrelationStore;

/// What an abort did.
#[derive(Debug)]
pub struct AbortReport {
    /// Handles resolved by this abort.
    pub cancelled: Vec<String>,
    /// Outcome of the aborted step, once every handle has resolved.
    pub outcome: Option<StepOutcome>,
    /// The detached cleanup; awaiting it is optional.
    pub cleanup: JoinHandle<CleanupReport>,
}

pub struct AbortCoordinator {
    infra: Arc<InfraLifecycleController>,
    steps: Arc<StepExecutionController>,
    correlations: Arc<dyn CallbackCorrelationStore>,
}

impl AbortCoordinator {
    pub fn new(
        infra: Arc<InfraLifecycleController>,
        steps: Arc<StepExecutionController>,
        correlations: Arc<dyn CallbackCorrelationStore>,
    ) -> Self {
        Self {
            infra,
            steps,
            correlations,
        }
    }

    /// Aborts the step that issued `callback_ids`.
    pub async fn abort_step(
        &self,
        stage: &StageScope,
        callback_ids: &[String],
    ) -> Result<AbortReport, OrchestratorError> {
        let infra = self.infra.clone();
        let scope = stage.clone();
        let cleanup = tokio::spawn(async move { infra.request_cleanup(&scope).await });

        let mut cancelled = Vec::new();
        let mut init_outcome = None;
        let mut step_ids = Vec::new();

        for id in callback_ids {
            let Some(entry) = self.correlations.get_optional(id).await? else {
                warn!(callback_id = %id, "Abort skipped unknown callback id");
                continue;
            };
            match entry.context {
                CorrelationContext::Infra { owner_execution_id } => {
                    if self.infra.cancel_init(id, ABORT_MESSAGE).await? {
                        cancelled.push(id.clone());
                        let outcome = StepOutcome::aborted(
                            owner_execution_id.clone(),
                            FailureInfo {
                                phase: Phase::Init,
                                message: ABORT_MESSAGE.to_string(),
                                task_id: Some(id.clone()),
                                infra_ref_id: None,
                                multi_task: false,
                            },
                        );
                        self.correlations
                            .claim_completion(&owner_execution_id, &outcome)
                            .await?;
                    }
                    init_outcome = self.correlations.completed_outcome(&owner_execution_id).await?;
                }
                CorrelationContext::Step { .. } => step_ids.push(id.clone()),
                CorrelationContext::Cleanup { .. } => {}
            }
        }

        let report = self.steps.cancel_outstanding(&step_ids, ABORT_MESSAGE).await?;
        cancelled.extend(report.cancelled);
        let outcome = report.outcome.or(init_outcome);

        info!(
            stage = %stage.stage_execution_id,
            cancelled = ?cancelled,
            "Aborted step"
        );

        Ok(AbortReport {
            cancelled,
            outcome,
            cleanup,
        })
    }
}
