//! Routes delivered callbacks to the controller owning the handle.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::dispatch::codec::decode_envelope;
use crate::error::{OrchestratorError, Phase};
use crate::infra::lifecycle::InfraLifecycleController;
use crate::infra::types::ExecutionInfraScope;
use crate::step::controller::{StepExecutionController, StepProgress};
use crate::step::outcome::TaskResponse;
use crate::store::types::{CorrelationContext, CorrelationEntry};
use crate::store::CallbackCorrelationStore;

/// What a delivery did.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    InfraReady(ExecutionInfraScope),
    /// Init reported failure; the stage cannot run.
    InfraFailed {
        task_id: String,
        infra_ref_id: Option<String>,
        message: String,
    },
    Step(StepProgress),
    CleanupAcknowledged {
        infra_ref_id: String,
    },
    Unknown {
        callback_id: String,
    },
}

pub struct CallbackRouter {
    correlations: Arc<dyn CallbackCorrelationStore>,
    infra: Arc<InfraLifecycleController>,
    steps: Arc<StepExecutionController>,
}

impl CallbackRouter {
    pub fn new(
        correlations: Arc<dyn CallbackCorrelationStore>,
        infra: Arc<InfraLifecycleController>,
        steps: Arc<StepExecutionController>,
    ) -> Self {
        Self {
            correlations,
            infra,
            steps,
        }
    }

    /// Routes a response to the controller owning `callback_id`.
    ///
    /// A response for an id with no recorded handle is held, so a callback
    /// racing ahead of the submission that produced its id is applied once
    /// the handle is recorded.
    pub async fn deliver(
        &self,
        callback_id: &str,
        response: TaskResponse,
    ) -> Result<Delivery, OrchestratorError> {
        let Some(entry) = self.correlations.get_optional(callback_id).await? else {
            return self.hold(callback_id, response).await;
        };
        self.route(entry, response).await
    }

    /// Decodes a codec envelope and delivers it. The phase of the owning
    /// handle is reported on decode failures.
    pub async fn deliver_encoded(
        &self,
        callback_id: &str,
        bytes: &[u8],
    ) -> Result<Delivery, OrchestratorError> {
        let Some(entry) = self.correlations.get_optional(callback_id).await? else {
            return match decode_envelope::<TaskResponse>(bytes) {
                Ok(response) => self.hold(callback_id, response).await,
                Err(e) => {
                    warn!(callback_id = %callback_id, error = %e, "Undecodable callback for unknown id");
                    Ok(unknown(callback_id))
                }
            };
        };
        let response: TaskResponse =
            decode_envelope(bytes).map_err(OrchestratorError::serialization(entry.handle.phase))?;
        self.route(entry, response).await
    }

    async fn hold(
        &self,
        callback_id: &str,
        response: TaskResponse,
    ) -> Result<Delivery, OrchestratorError> {
        self.correlations.hold_delivery(callback_id, &response).await?;

        // The handle may have been recorded between the lookup and the hold
        let Some(entry) = self.correlations.get_optional(callback_id).await? else {
            debug!(callback_id = %callback_id, "Holding callback until its handle is recorded");
            return Ok(Delivery::Unknown {
                callback_id: callback_id.to_string(),
            });
        };
        let response = self
            .correlations
            .take_held_delivery(callback_id)
            .await?
            .unwrap_or(response);
        self.route(entry, response).await
    }

    async fn route(
        &self,
        entry: CorrelationEntry,
        response: TaskResponse,
    ) -> Result<Delivery, OrchestratorError> {
        let callback_id = entry.handle.id.clone();
        debug!(
            callback_id = %callback_id,
            phase = %entry.handle.phase,
            response = response.kind(),
            "Routing callback"
        );

        match entry.context {
            CorrelationContext::Infra { .. } => {
                let result = response.into_init_result().map_err(|other| {
                    OrchestratorError::UnexpectedResponse {
                        phase: Phase::Init,
                        callback_id: callback_id.clone(),
                        detail: format!("{} response for an init task", other.kind()),
                    }
                })?;
                match self.infra.on_init_callback(&callback_id, result).await {
                    Ok(scope) => Ok(Delivery::InfraReady(scope)),
                    Err(OrchestratorError::InfraInitialization {
                        task_id,
                        infra_ref_id,
                        message,
                    }) => Ok(Delivery::InfraFailed {
                        task_id,
                        infra_ref_id,
                        message,
                    }),
                    Err(e) => Err(e),
                }
            }
            CorrelationContext::Step { .. } => Ok(Delivery::Step(
                self.steps.on_callback(&callback_id, response).await?,
            )),
            CorrelationContext::Cleanup { .. } => {
                match self.infra.acknowledge_cleanup(&callback_id, &response).await? {
                    Some(infra_ref_id) => Ok(Delivery::CleanupAcknowledged { infra_ref_id }),
                    None => Ok(unknown(&callback_id)),
                }
            }
        }
    }
}

fn unknown(callback_id: &str) -> Delivery {
    warn!(callback_id = %callback_id, "Callback for unknown id");
    Delivery::Unknown {
        callback_id: callback_id.to_string(),
    }
}
