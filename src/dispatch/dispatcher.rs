//! Task dispatcher shared by the controllers.
//!
//! Wraps a [`TaskDispatchClient`] with the configured codec, the cached
//! callback token and metrics. Parameters are always encoded before any remote
//! call is made, so a serialization failure never reaches the wire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::client::TaskDispatchClient;
use super::codec::CodecKind;
use super::types::{
    AccountScope, CallbackDescriptor, CallbackToken, TaskDescriptor, TaskExecutionStage,
    TaskMode, TaskType,
};
use crate::config::OrchestratorConfig;
use crate::error::{DispatchError, OrchestratorError, Phase};
use crate::metrics::MetricsCollector;

/// What to submit, minus the parameters.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub phase: Phase,
    pub task_type: TaskType,
    pub account: AccountScope,
    pub execution_timeout: Duration,
    pub log_keys: Vec<String>,
    pub selectors: Vec<String>,
    pub parked: bool,
}

impl TaskRequest {
    pub fn new(phase: Phase, task_type: TaskType, account: AccountScope) -> Self {
        Self {
            phase,
            task_type,
            account,
            execution_timeout: Duration::ZERO,
            log_keys: Vec::new(),
            selectors: Vec::new(),
            parked: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_log_keys(mut self, log_keys: Vec<String>) -> Self {
        self.log_keys = log_keys;
        self
    }

    pub fn with_selectors(mut self, selectors: Vec<String>) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn parked(mut self) -> Self {
        self.parked = true;
        self
    }
}

/// Submits codec-encoded tasks on behalf of the controllers.
pub struct TaskDispatcher {
    client: Arc<dyn TaskDispatchClient>,
    codec: CodecKind,
    callback: CallbackDescriptor,
    token: OnceCell<CallbackToken>,
    hold_for: Duration,
    force_execute: bool,
    metrics: MetricsCollector,
}

impl TaskDispatcher {
    pub fn new(client: Arc<dyn TaskDispatchClient>, config: &OrchestratorConfig) -> Self {
        Self {
            client,
            codec: config.codec,
            callback: CallbackDescriptor {
                url: config.callback_url.clone(),
                namespace: config.key_prefix.clone(),
            },
            token: OnceCell::new(),
            hold_for: config.hold_for,
            force_execute: config.force_execute,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Returns the callback token, registering it on first use.
    pub async fn callback_token(&self) -> Result<CallbackToken, DispatchError> {
        let token = self
            .token
            .get_or_try_init(|| async {
                let token = self.client.register_callback(&self.callback).await?;
                info!(url = %self.callback.url, "Registered dispatch callback");
                Ok::<_, DispatchError>(token)
            })
            .await?;
        Ok(token.clone())
    }

    /// Encodes `params` and submits an asynchronous task.
    ///
    /// # Errors
    ///
    /// - `OrchestratorError::Serialization` if encoding fails (no remote call is made)
    /// - `OrchestratorError::RemoteTransport` if registration or submission fails
    pub async fn submit<P>(&self, request: TaskRequest, params: &P) -> Result<String, OrchestratorError>
    where
        P: Serialize + ?Sized + Sync,
    {
        let phase = request.phase;
        let parameters = self
            .codec
            .encode(params)
            .map_err(OrchestratorError::serialization(phase))?;

        let token = self
            .callback_token()
            .await
            .map_err(OrchestratorError::transport(phase))?;

        let descriptor = TaskDescriptor::new(request.account, request.task_type, parameters)
            .with_execution_timeout(request.execution_timeout)
            .with_log_keys(request.log_keys)
            .with_selectors(request.selectors)
            .with_force_execute(self.force_execute)
            .with_parked(request.parked);

        let started = Instant::now();
        let result = self
            .client
            .submit(&descriptor, &token, TaskMode::Async, self.hold_for)
            .await;
        self.metrics.record_submission(
            request.task_type.as_str(),
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        let task_id = result.map_err(OrchestratorError::transport(phase))?;
        debug!(
            task_id = %task_id,
            task_type = %request.task_type,
            phase = %phase,
            timeout_ms = descriptor.execution_timeout_ms,
            "Submitted task"
        );
        Ok(task_id)
    }

    /// Cancels a remote task.
    pub async fn cancel(
        &self,
        phase: Phase,
        account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, OrchestratorError> {
        let result = self.client.cancel(account_id, task_id).await;
        self.metrics.record_cancellation(result.is_ok());
        result.map_err(OrchestratorError::transport(phase))
    }

    /// Fetches the stage of a remote task for diagnostics.
    pub async fn progress(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, OrchestratorError> {
        self.client
            .poll_progress(account_id, task_id)
            .await
            .map_err(OrchestratorError::transport(Phase::Execute))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::dispatch::codec::decode_envelope;
    use crate::dispatch::types::CleanupRequest;
    use crate::test_support::FakeDispatchClient;

    fn account() -> AccountScope {
        AccountScope::new("acct", "org", "proj")
    }

    fn dispatcher(client: Arc<FakeDispatchClient>, codec: CodecKind) -> TaskDispatcher {
        let config = OrchestratorConfig::default().with_codec(codec);
        TaskDispatcher::new(client, &config)
    }

    #[tokio::test]
    async fn test_submit_encodes_params_and_registers_once() {
        let client = Arc::new(FakeDispatchClient::new());
        let dispatcher = dispatcher(client.clone(), CodecKind::Binary);
        let params = CleanupRequest {
            account_id: "acct".to_string(),
            infra_ref_id: "infra-1".to_string(),
        };

        for _ in 0..2 {
            let request = TaskRequest::new(Phase::Cleanup, TaskType::CleanupInfra, account())
                .with_timeout(Duration::from_secs(600));
            dispatcher.submit(request, &params).await.unwrap();
        }

        assert_eq!(client.registrations(), 1);
        let submitted = client.submissions();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].descriptor.execution_timeout_ms, 600_000);
        assert_eq!(submitted[0].mode, TaskMode::Async);

        let decoded: CleanupRequest =
            decode_envelope(&submitted[0].descriptor.parameters.bytes).unwrap();
        assert_eq!(decoded, params);
    }

    #[tokio::test]
    async fn test_serialization_failure_makes_no_remote_call() {
        let client = Arc::new(FakeDispatchClient::new());
        let dispatcher = dispatcher(client.clone(), CodecKind::Json);
        let mut unencodable = HashMap::new();
        unencodable.insert((1u8, 2u8), "value");

        let request = TaskRequest::new(Phase::Init, TaskType::InitInfra, account());
        let err = dispatcher.submit(request, &unencodable).await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Serialization {
                phase: Phase::Init,
                ..
            }
        ));
        assert_eq!(client.registrations(), 0);
        assert!(client.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_names_phase() {
        let client = Arc::new(FakeDispatchClient::new());
        client.fail_submissions_of(TaskType::ExecuteStep, "no eligible delegates");
        let dispatcher = dispatcher(client.clone(), CodecKind::Json);

        let request = TaskRequest::new(Phase::Execute, TaskType::ExecuteStep, account());
        let err = dispatcher.submit(request, &"params").await.unwrap_err();

        assert_eq!(err.phase(), Some(Phase::Execute));
        assert!(err.to_string().contains("no eligible delegates"));
    }
}
