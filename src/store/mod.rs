//! Durable stores behind the orchestration state machine.
//!
//! Two contracts:
//!
//! - [`CallbackCorrelationStore`]: callback id → owning step/phase and its
//!   resolution, so a delivery can be routed by any process.
//! - [`SweepingOutputChannel`]: write-once key/value handoff scoped to a
//!   stage, used to pass the infra reference id from Init to later phases.
//!
//! Both are implemented by [`RedisStore`] and [`PostgresStore`]. Absence is
//! `Ok(None)`, never an error. Records expire after the configured record TTL.

pub mod migrations;
pub mod postgres;
pub mod redis;
pub mod schema;
pub mod types;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::step::outcome::{StepOutcome, TaskResponse};

pub use self::postgres::PostgresStore;
pub use self::redis::RedisStore;
pub use types::{
    CallbackHandle, CorrelationContext, CorrelationEntry, Resolution, ResolveResult,
    StageScope, SweepingRecord, INFRA_OUTPUT_KEY, INFRA_SCOPE_KEY,
};

/// Durable map from callback id to its correlation entry.
#[async_trait]
pub trait CallbackCorrelationStore: Send + Sync {
    /// Records an entry, replacing any entry with the same id.
    async fn put(&self, entry: &CorrelationEntry) -> Result<(), StoreError>;

    async fn get_optional(&self, callback_id: &str)
        -> Result<Option<CorrelationEntry>, StoreError>;

    /// Resolves a handle. Only the first resolution for an id is kept.
    async fn resolve(
        &self,
        callback_id: &str,
        resolution: &Resolution,
    ) -> Result<ResolveResult, StoreError>;

    async fn remove(&self, callback_id: &str) -> Result<(), StoreError>;

    /// Records the outcome of a step. Returns `false` if one was already recorded.
    async fn claim_completion(
        &self,
        step_execution_id: &str,
        outcome: &StepOutcome,
    ) -> Result<bool, StoreError>;

    async fn completed_outcome(
        &self,
        step_execution_id: &str,
    ) -> Result<Option<StepOutcome>, StoreError>;

    /// Keeps a response delivered for an id that has no entry yet, so it can
    /// be applied once the entry is recorded. Only the first held response
    /// for an id is kept.
    async fn hold_delivery(
        &self,
        callback_id: &str,
        response: &TaskResponse,
    ) -> Result<bool, StoreError>;

    /// Atomically removes and returns a held response.
    async fn take_held_delivery(
        &self,
        callback_id: &str,
    ) -> Result<Option<TaskResponse>, StoreError>;
}

/// Durable, stage-scoped, write-once key/value handoff.
#[async_trait]
pub trait SweepingOutputChannel: Send + Sync {
    /// Writes a record unless one exists under its key. Returns whether it was written.
    async fn put(&self, record: &SweepingRecord) -> Result<bool, StoreError>;

    async fn get_optional(
        &self,
        scope: &StageScope,
        key: &str,
    ) -> Result<Option<SweepingRecord>, StoreError>;

    /// Overwrites a record in one write, creating it if absent.
    async fn replace(&self, record: &SweepingRecord) -> Result<(), StoreError>;

    /// Atomically removes and returns a record.
    async fn take(
        &self,
        scope: &StageScope,
        key: &str,
    ) -> Result<Option<SweepingRecord>, StoreError>;
}
