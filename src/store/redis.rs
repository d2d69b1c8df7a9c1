//! Redis-backed correlation store and sweeping output channel.
//!
//! # Key Structure
//!
//! - `{prefix}:callback:{callback_id}`: correlation entry without its resolution
//! - `{prefix}:resolution:{callback_id}`: resolution, written with `SET NX`
//! - `{prefix}:outcome:{step_execution_id}`: step outcome, written with `SET NX`
//! - `{prefix}:sweeping:{stage_key}:{output_key}`: sweeping record, written with
//!   `SET NX` and taken with `GETDEL`
//! - `{prefix}:held:{callback_id}`: response delivered before its entry,
//!   written with `SET NX` and taken with `GETDEL`
//!
//! Keeping the resolution under its own key makes first-writer-wins a single
//! atomic command instead of a read-modify-write on the entry. Every key is
//! written with `EX` so abandoned records expire.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::types::{CorrelationEntry, Resolution, ResolveResult, StageScope, SweepingRecord};
use super::{CallbackCorrelationStore, SweepingOutputChannel};
use crate::error::StoreError;
use crate::step::outcome::{StepOutcome, TaskResponse};

/// Default record lifetime: 7 days.
const DEFAULT_RECORD_TTL_SECS: u64 = 604800;

/// Redis implementation of both store contracts.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
    ttl_secs: u64,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Prefix for every key this store writes
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            ttl_secs: DEFAULT_RECORD_TTL_SECS,
        }
    }

    /// Sets how long written keys live. Sub-second values round up to one second.
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs().max(1);
        self
    }

    /// `SET key value EX ttl`.
    async fn set_expiring(&self, key: String, value: String) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// `SET key value EX ttl NX`. Returns whether the key was written.
    async fn set_expiring_nx(&self, key: String, value: String) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(written.is_some())
    }

    async fn get_del(&self, key: String) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let stored: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(stored)
    }

    fn callback_key(&self, callback_id: &str) -> String {
        format!("{}:callback:{}", self.prefix, callback_id)
    }

    fn resolution_key(&self, callback_id: &str) -> String {
        format!("{}:resolution:{}", self.prefix, callback_id)
    }

    fn outcome_key(&self, step_execution_id: &str) -> String {
        format!("{}:outcome:{}", self.prefix, step_execution_id)
    }

    fn sweeping_key(&self, scope: &StageScope, key: &str) -> String {
        format!("{}:sweeping:{}:{}", self.prefix, scope.storage_key(), key)
    }

    fn held_key(&self, callback_id: &str) -> String {
        format!("{}:held:{}", self.prefix, callback_id)
    }
}

#[async_trait]
impl CallbackCorrelationStore for RedisStore {
    async fn put(&self, entry: &CorrelationEntry) -> Result<(), StoreError> {
        let mut stored = entry.clone();
        let resolution = stored.resolution.take();

        self.set_expiring(
            self.callback_key(&entry.handle.id),
            serde_json::to_string(&stored)?,
        )
        .await?;

        if let Some(resolution) = resolution {
            self.set_expiring_nx(
                self.resolution_key(&entry.handle.id),
                serde_json::to_string(&resolution)?,
            )
            .await?;
        }

        Ok(())
    }

    async fn get_optional(
        &self,
        callback_id: &str,
    ) -> Result<Option<CorrelationEntry>, StoreError> {
        let mut conn = self.redis.clone();
        let (entry, resolution): (Option<String>, Option<String>) = redis::pipe()
            .get(self.callback_key(callback_id))
            .get(self.resolution_key(callback_id))
            .query_async(&mut conn)
            .await?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut entry: CorrelationEntry = serde_json::from_str(&entry)?;
        entry.resolution = resolution
            .map(|r| serde_json::from_str::<Resolution>(&r))
            .transpose()?;
        Ok(Some(entry))
    }

    async fn resolve(
        &self,
        callback_id: &str,
        resolution: &Resolution,
    ) -> Result<ResolveResult, StoreError> {
        let Some(mut entry) = CallbackCorrelationStore::get_optional(self, callback_id).await?
        else {
            return Ok(ResolveResult::Unknown);
        };

        if entry.resolution.is_some() {
            return Ok(ResolveResult::AlreadyResolved(entry));
        }

        let written = self
            .set_expiring_nx(
                self.resolution_key(callback_id),
                serde_json::to_string(resolution)?,
            )
            .await?;

        if written {
            entry.resolution = Some(resolution.clone());
            return Ok(ResolveResult::Applied(entry));
        }

        // Lost the race to another writer
        let mut conn = self.redis.clone();
        let existing: Option<String> = conn.get(self.resolution_key(callback_id)).await?;
        entry.resolution = existing
            .map(|r| serde_json::from_str::<Resolution>(&r))
            .transpose()?;
        Ok(ResolveResult::AlreadyResolved(entry))
    }

    async fn remove(&self, callback_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .del(self.callback_key(callback_id))
            .del(self.resolution_key(callback_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_completion(
        &self,
        step_execution_id: &str,
        outcome: &StepOutcome,
    ) -> Result<bool, StoreError> {
        self.set_expiring_nx(
            self.outcome_key(step_execution_id),
            serde_json::to_string(outcome)?,
        )
        .await
    }

    async fn completed_outcome(
        &self,
        step_execution_id: &str,
    ) -> Result<Option<StepOutcome>, StoreError> {
        let mut conn = self.redis.clone();
        let stored: Option<String> = conn.get(self.outcome_key(step_execution_id)).await?;
        Ok(stored.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn hold_delivery(
        &self,
        callback_id: &str,
        response: &TaskResponse,
    ) -> Result<bool, StoreError> {
        self.set_expiring_nx(self.held_key(callback_id), serde_json::to_string(response)?)
            .await
    }

    async fn take_held_delivery(
        &self,
        callback_id: &str,
    ) -> Result<Option<TaskResponse>, StoreError> {
        let stored = self.get_del(self.held_key(callback_id)).await?;
        Ok(stored.map(|s| serde_json::from_str(&s)).transpose()?)
    }
}

#[async_trait]
impl SweepingOutputChannel for RedisStore {
    async fn put(&self, record: &SweepingRecord) -> Result<bool, StoreError> {
        self.set_expiring_nx(
            self.sweeping_key(&record.scope, &record.key),
            serde_json::to_string(record)?,
        )
        .await
    }

    async fn get_optional(
        &self,
        scope: &StageScope,
        key: &str,
    ) -> Result<Option<SweepingRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let stored: Option<String> = conn.get(self.sweeping_key(scope, key)).await?;
        Ok(stored.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn replace(&self, record: &SweepingRecord) -> Result<(), StoreError> {
        self.set_expiring(
            self.sweeping_key(&record.scope, &record.key),
            serde_json::to_string(record)?,
        )
        .await
    }

    async fn take(
        &self,
        scope: &StageScope,
        key: &str,
    ) -> Result<Option<SweepingRecord>, StoreError> {
        let stored = self.get_del(self.sweeping_key(scope, key)).await?;
        Ok(stored.map(|s| serde_json::from_str(&s)).transpose()?)
    }
}
