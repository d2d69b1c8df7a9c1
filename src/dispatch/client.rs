//! Task dispatch client.
//!
//! [`TaskDispatchClient`] is the seam to the remote task-submission service.
//! [`HttpDispatchClient`] implements it over HTTP/JSON, applying a separate
//! RPC deadline to every operation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::{
    duration_millis, CallbackDescriptor, CallbackToken, TaskDescriptor, TaskExecutionStage,
    TaskMode,
};
use crate::config::RpcDeadlines;
use crate::error::{DispatchError, DispatchOperation};

/// Client for the remote task-submission protocol.
#[async_trait]
pub trait TaskDispatchClient: Send + Sync {
    /// Queues a task and returns its id.
    async fn submit(
        &self,
        descriptor: &TaskDescriptor,
        callback: &CallbackToken,
        mode: TaskMode,
        hold_for: Duration,
    ) -> Result<String, DispatchError>;

    /// Cancels a task, returning the stage it was in when cancelled.
    async fn cancel(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, DispatchError>;

    /// Reports the current stage of a task. Diagnostics only.
    async fn poll_progress(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, DispatchError>;

    /// Registers where completions go and returns the token to submit with.
    async fn register_callback(
        &self,
        callback: &CallbackDescriptor,
    ) -> Result<CallbackToken, DispatchError>;
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    descriptor: &'a TaskDescriptor,
    callback_token: &'a CallbackToken,
    mode: TaskMode,
    hold_for_ms: u64,
}

#[derive(Serialize)]
struct CancelBody<'a> {
    account_id: &'a str,
}

#[derive(Deserialize)]
struct SubmitReply {
    task_id: String,
}

#[derive(Deserialize)]
struct StageReply {
    stage: TaskExecutionStage,
}

#[derive(Deserialize)]
struct RegisterReply {
    callback_token: CallbackToken,
}

#[derive(Deserialize)]
struct ErrorBody {
    description: Option<String>,
}

/// HTTP/JSON implementation of [`TaskDispatchClient`].
#[derive(Debug, Clone)]
pub struct HttpDispatchClient {
    http_client: Client,
    base_url: String,
    deadlines: RpcDeadlines,
}

impl HttpDispatchClient {
    /// Creates a client for the dispatch service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ClientBuild` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, deadlines: RpcDeadlines) -> Result<Self, DispatchError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DispatchError::ClientBuild(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            deadlines,
        })
    }

    /// Get the dispatch service base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn tasks_url(&self) -> String {
        format!("{}/v1/tasks", self.base_url)
    }

    fn task_url(&self, task_id: &str, action: &str) -> String {
        format!(
            "{}/v1/tasks/{}/{}",
            self.base_url,
            urlencoding::encode(task_id),
            action
        )
    }

    async fn send<R: DeserializeOwned>(
        &self,
        operation: DispatchOperation,
        request: RequestBuilder,
        deadline: Duration,
    ) -> Result<R, DispatchError> {
        let response = request.timeout(deadline).send().await.map_err(|e| {
            warn!(operation = %operation, error = %e, "Dispatch request failed");
            DispatchError::Transport {
                operation,
                description: operation.generic_message().to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                operation,
                code: status.as_u16(),
                description: error_description(operation, &body),
            });
        }

        let body = response.bytes().await.map_err(|e| DispatchError::Transport {
            operation,
            description: e.to_string(),
        })?;

        serde_json::from_slice(&body)
            .map_err(|source| DispatchError::InvalidResponse { operation, source })
    }
}

#[async_trait]
impl TaskDispatchClient for HttpDispatchClient {
    async fn submit(
        &self,
        descriptor: &TaskDescriptor,
        callback: &CallbackToken,
        mode: TaskMode,
        hold_for: Duration,
    ) -> Result<String, DispatchError> {
        let body = SubmitBody {
            descriptor,
            callback_token: callback,
            mode,
            hold_for_ms: duration_millis(hold_for),
        };
        let request = self.http_client.post(self.tasks_url()).json(&body);
        let reply: SubmitReply = self
            .send(DispatchOperation::Submit, request, self.deadlines.submit)
            .await?;
        Ok(reply.task_id)
    }

    async fn cancel(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, DispatchError> {
        let request = self
            .http_client
            .post(self.task_url(task_id, "cancel"))
            .json(&CancelBody { account_id });
        let reply: StageReply = self
            .send(DispatchOperation::Cancel, request, self.deadlines.cancel)
            .await?;
        Ok(reply.stage)
    }

    async fn poll_progress(
        &self,
        account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, DispatchError> {
        let url = format!(
            "{}?accountId={}",
            self.task_url(task_id, "progress"),
            urlencoding::encode(account_id)
        );
        let request = self.http_client.get(url);
        let reply: StageReply = self
            .send(DispatchOperation::Progress, request, self.deadlines.progress)
            .await?;
        Ok(reply.stage)
    }

    async fn register_callback(
        &self,
        callback: &CallbackDescriptor,
    ) -> Result<CallbackToken, DispatchError> {
        let request = self
            .http_client
            .post(format!("{}/v1/callbacks", self.base_url))
            .json(callback);
        let reply: RegisterReply = self
            .send(
                DispatchOperation::RegisterCallback,
                request,
                self.deadlines.register_callback,
            )
            .await?;
        Ok(reply.callback_token)
    }
}

/// Extracts the remote status description from an error body, falling back
/// to the operation's generic message.
fn error_description(operation: DispatchOperation, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.description)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| operation.generic_message().to_string())
}
