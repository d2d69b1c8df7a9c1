//! In-memory fakes of the store and dispatch seams for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::{DispatchMode, OrchestratorConfig};
use crate::dispatch::client::TaskDispatchClient;
use crate::dispatch::types::{
    AccountScope, CallbackDescriptor, CallbackToken, TaskDescriptor, TaskExecutionStage,
    TaskMode, TaskType,
};
use crate::error::{DispatchError, DispatchOperation, StoreError};
use crate::infra::types::{ShellType, StepSpec};
use crate::orchestrator::Orchestrator;
use crate::step::outcome::{StepOutcome, TaskResponse};
use crate::store::types::{
    CorrelationEntry, Resolution, ResolveResult, StageScope, SweepingRecord,
};
use crate::store::{CallbackCorrelationStore, SweepingOutputChannel};

/// One recorded submit call.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: String,
    pub descriptor: TaskDescriptor,
    pub token: CallbackToken,
    pub mode: TaskMode,
    pub hold_for: Duration,
}

/// Runs inside a submit call, after the task id is assigned and before it is returned.
pub type SubmitHook = Arc<dyn Fn(String, TaskType) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatch client that records calls and answers with sequential task ids.
#[derive(Default)]
pub struct FakeDispatchClient {
    next_id: AtomicUsize,
    registrations: AtomicUsize,
    submissions: Mutex<Vec<Submission>>,
    cancels: Mutex<Vec<String>>,
    failures: Mutex<HashMap<TaskType, String>>,
    fail_cancels: AtomicBool,
    submit_hook: Mutex<Option<SubmitHook>>,
}

impl FakeDispatchClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submissions_of(&self, task_type: TaskType) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.descriptor.task_type == task_type)
            .collect()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }

    /// Rejects every later submission of `task_type` with `description`.
    pub fn fail_submissions_of(&self, task_type: TaskType, description: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(task_type, description.to_string());
    }

    pub fn fail_cancels(&self) {
        self.fail_cancels.store(true, Ordering::SeqCst);
    }

    /// Runs `hook` inside every later submit call.
    pub fn on_submit(&self, hook: SubmitHook) {
        *self.submit_hook.lock().unwrap() = Some(hook);
    }
}

#[async_trait]
impl TaskDispatchClient for FakeDispatchClient {
    async fn submit(
        &self,
        descriptor: &TaskDescriptor,
        token: &CallbackToken,
        mode: TaskMode,
        hold_for: Duration,
    ) -> Result<String, DispatchError> {
        if let Some(description) = self.failures.lock().unwrap().get(&descriptor.task_type) {
            return Err(DispatchError::Rejected {
                operation: DispatchOperation::Submit,
                code: 503,
                description: description.clone(),
            });
        }

        let task_id = format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.submissions.lock().unwrap().push(Submission {
            task_id: task_id.clone(),
            descriptor: descriptor.clone(),
            token: token.clone(),
            mode,
            hold_for,
        });

        let hook = self.submit_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(task_id.clone(), descriptor.task_type).await;
        }
        Ok(task_id)
    }

    async fn cancel(
        &self,
        _account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, DispatchError> {
        self.cancels.lock().unwrap().push(task_id.to_string());
        if self.fail_cancels.load(Ordering::SeqCst) {
            return Err(DispatchError::Transport {
                operation: DispatchOperation::Cancel,
                description: DispatchOperation::Cancel.generic_message().to_string(),
            });
        }
        Ok(TaskExecutionStage::Cancelled)
    }

    async fn poll_progress(
        &self,
        _account_id: &str,
        task_id: &str,
    ) -> Result<TaskExecutionStage, DispatchError> {
        if self.cancels.lock().unwrap().iter().any(|id| id == task_id) {
            return Ok(TaskExecutionStage::Cancelled);
        }
        Ok(TaskExecutionStage::Executing)
    }

    async fn register_callback(
        &self,
        _descriptor: &CallbackDescriptor,
    ) -> Result<CallbackToken, DispatchError> {
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CallbackToken(format!("token-{}", n)))
    }
}

/// Mutex-backed implementation of both store contracts.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, CorrelationEntry>>,
    outcomes: Mutex<HashMap<String, StepOutcome>>,
    sweeping: Mutex<HashMap<(String, String), SweepingRecord>>,
    held: Mutex<HashMap<String, TaskResponse>>,
    writes: Mutex<HashMap<String, usize>>,
    takes: Mutex<HashMap<String, usize>>,
    fail_next: Mutex<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful sweeping writes under `key`, across all stages.
    pub fn writes_of(&self, key: &str) -> usize {
        self.writes.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Number of sweeping takes that removed a record under `key`.
    pub fn takes_of(&self, key: &str) -> usize {
        self.takes.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn held(&self, callback_id: &str) -> Option<TaskResponse> {
        self.held.lock().unwrap().get(callback_id).cloned()
    }

    /// Fails the next call of `operation` (`"claim_completion"`,
    /// `"sweeping_put"` or `"replace"`) without touching state.
    pub fn fail_next(&self, operation: &'static str) {
        self.fail_next.lock().unwrap().insert(operation);
    }

    fn injected_failure(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.fail_next.lock().unwrap().remove(operation) {
            return Err(StoreError::ConnectionFailed(format!(
                "{} failed: connection reset",
                operation
            )));
        }
        Ok(())
    }

    pub fn entry(&self, callback_id: &str) -> Option<CorrelationEntry> {
        self.entries.lock().unwrap().get(callback_id).cloned()
    }

    pub fn sweeping_value(&self, scope: &StageScope, key: &str) -> Option<String> {
        self.sweeping
            .lock()
            .unwrap()
            .get(&(scope.storage_key(), key.to_string()))
            .map(|r| r.value.clone())
    }
}

#[async_trait]
impl CallbackCorrelationStore for MemoryStore {
    async fn put(&self, entry: &CorrelationEntry) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.handle.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_optional(
        &self,
        callback_id: &str,
    ) -> Result<Option<CorrelationEntry>, StoreError> {
        Ok(self.entry(callback_id))
    }

    async fn resolve(
        &self,
        callback_id: &str,
        resolution: &Resolution,
    ) -> Result<ResolveResult, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(callback_id) else {
            return Ok(ResolveResult::Unknown);
        };
        if entry.resolution.is_some() {
            return Ok(ResolveResult::AlreadyResolved(entry.clone()));
        }
        entry.resolution = Some(resolution.clone());
        Ok(ResolveResult::Applied(entry.clone()))
    }

    async fn remove(&self, callback_id: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(callback_id);
        Ok(())
    }

    async fn claim_completion(
        &self,
        step_execution_id: &str,
        outcome: &StepOutcome,
    ) -> Result<bool, StoreError> {
        self.injected_failure("claim_completion")?;
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.contains_key(step_execution_id) {
            return Ok(false);
        }
        outcomes.insert(step_execution_id.to_string(), outcome.clone());
        Ok(true)
    }

    async fn completed_outcome(
        &self,
        step_execution_id: &str,
    ) -> Result<Option<StepOutcome>, StoreError> {
        Ok(self.outcomes.lock().unwrap().get(step_execution_id).cloned())
    }

    async fn hold_delivery(
        &self,
        callback_id: &str,
        response: &TaskResponse,
    ) -> Result<bool, StoreError> {
        let mut held = self.held.lock().unwrap();
        if held.contains_key(callback_id) {
            return Ok(false);
        }
        held.insert(callback_id.to_string(), response.clone());
        Ok(true)
    }

    async fn take_held_delivery(
        &self,
        callback_id: &str,
    ) -> Result<Option<TaskResponse>, StoreError> {
        Ok(self.held.lock().unwrap().remove(callback_id))
    }
}

#[async_trait]
impl SweepingOutputChannel for MemoryStore {
    async fn put(&self, record: &SweepingRecord) -> Result<bool, StoreError> {
        self.injected_failure("sweeping_put")?;
        let key = (record.scope.storage_key(), record.key.clone());
        let mut sweeping = self.sweeping.lock().unwrap();
        if sweeping.contains_key(&key) {
            return Ok(false);
        }
        sweeping.insert(key, record.clone());
        *self
            .writes
            .lock()
            .unwrap()
            .entry(record.key.clone())
            .or_insert(0) += 1;
        Ok(true)
    }

    async fn get_optional(
        &self,
        scope: &StageScope,
        key: &str,
    ) -> Result<Option<SweepingRecord>, StoreError> {
        Ok(self
            .sweeping
            .lock()
            .unwrap()
            .get(&(scope.storage_key(), key.to_string()))
            .cloned())
    }

    async fn replace(&self, record: &SweepingRecord) -> Result<(), StoreError> {
        self.injected_failure("replace")?;
        self.sweeping.lock().unwrap().insert(
            (record.scope.storage_key(), record.key.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn take(
        &self,
        scope: &StageScope,
        key: &str,
    ) -> Result<Option<SweepingRecord>, StoreError> {
        let taken = self
            .sweeping
            .lock()
            .unwrap()
            .remove(&(scope.storage_key(), key.to_string()));
        if taken.is_some() {
            *self.takes.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        }
        Ok(taken)
    }
}

pub fn stage() -> StageScope {
    StageScope::new(AccountScope::new("acct", "org", "proj"), "stage-1")
}

pub fn run_spec(step_id: &str) -> StepSpec {
    StepSpec::run(step_id, "alpine:3.19", ShellType::Sh, "echo hello")
}

/// Orchestrator wired to in-memory fakes.
pub struct Harness {
    pub client: Arc<FakeDispatchClient>,
    pub store: Arc<MemoryStore>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(config: OrchestratorConfig) -> Self {
        let client = Arc::new(FakeDispatchClient::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator =
            Orchestrator::from_parts(config, client.clone(), store.clone(), store.clone());
        Self {
            client,
            store,
            orchestrator,
        }
    }

    pub fn single_task() -> Self {
        Self::new(OrchestratorConfig::default())
    }

    pub fn dual_task() -> Self {
        Self::new(OrchestratorConfig::default().with_dispatch_mode(DispatchMode::DualTask))
    }
}
