//! Storage trait definitions for cfgplane
//!
//! These traits define the persistence seam the consistency primitives are
//! written against:
//! - `Shard`: one database partition, able to open transactions
//! - `Txn`: an open transaction exposing the row operations the primitives need
//! - `ShardResolver`: maps tenants onto shards
//!
//! Every `Txn` method corresponds to one parameterized SQL statement. The
//! branching logic (upsert-vs-insert, guard checks, retry signalling) lives
//! in `cfgplane-core`, so backends only promise statement semantics:
//! - writes to a row held by another open transaction wait for it to finish;
//! - an insert colliding with an existing unique key returns
//!   `StorageError::DuplicateKey`;
//! - rows written by an uncommitted transaction are invisible to others.
//!
//! An in-memory implementation is provided in the `fakes` module and a
//! PostgreSQL one in `postgres`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One horizontal partition of the relational store.
#[async_trait]
pub trait Shard: Send + Sync {
    /// Stable identifier of this shard.
    fn id(&self) -> u32;

    /// Open a new transaction.
    async fn begin(&self) -> StorageResult<Box<dyn Txn>>;
}

/// An open transaction on a single shard.
///
/// Dropping a transaction without calling `commit` rolls it back.
#[async_trait]
pub trait Txn: Send {
    /// The shard this transaction runs on.
    fn shard(&self) -> Arc<dyn Shard>;

    // -- id_generators -------------------------------------------------------

    /// `INSERT` the counter row at `floor` unless it exists.
    async fn seed_counter(&mut self, kind: IdKind, floor: u32) -> StorageResult<()>;

    /// `UPDATE id_generators SET max_id = max_id + step WHERE resource = kind`.
    /// Returns rows affected.
    async fn bump_counter(&mut self, kind: IdKind, step: u32) -> StorageResult<u64>;

    /// Read the current `max_id` of a counter.
    async fn read_counter(&mut self, kind: IdKind) -> StorageResult<Option<u32>>;

    // -- resource_locks ------------------------------------------------------

    /// `UPDATE ... SET res_count = res_count + 1`. Returns rows affected.
    async fn increment_lock(&mut self, key: &LockKey) -> StorageResult<u64>;

    /// `SELECT res_count ... FOR UPDATE`.
    async fn lock_count_for_update(&mut self, key: &LockKey) -> StorageResult<Option<u32>>;

    /// Insert a new slot. Fails with `DuplicateKey` when the key exists.
    async fn insert_lock(&mut self, row: &ResourceLockRow) -> StorageResult<()>;

    /// `UPDATE ... SET res_count = res_count - 1 WHERE res_count > 1`.
    async fn decrement_lock(&mut self, key: &LockKey) -> StorageResult<u64>;

    /// Delete the slot. Returns rows affected.
    async fn delete_lock(&mut self, key: &LockKey) -> StorageResult<u64>;

    // -- events --------------------------------------------------------------

    /// Bulk insert event rows.
    async fn insert_events(&mut self, rows: &[EventRow]) -> StorageResult<()>;

    /// `UPDATE events SET final_status = ? WHERE id IN (...) AND final_status = 'unknown'`.
    ///
    /// Events already settled are left alone and not counted.
    async fn set_event_status(&mut self, ids: &[u32], status: FinalStatus) -> StorageResult<u64>;

    /// Ascending listing of events matching `filter`.
    async fn list_events(&mut self, filter: &EventFilter, page: Page)
        -> StorageResult<Vec<EventRow>>;

    async fn get_event(&mut self, id: u32) -> StorageResult<Option<EventRow>>;

    /// Insert or overwrite the cursor reminder row.
    async fn upsert_cursor_reminder(&mut self, cursor: u32, at: DateTime<Utc>)
        -> StorageResult<()>;

    /// Largest event id created strictly before `before`, sentinel excluded.
    async fn newest_event_before(&mut self, before: DateTime<Utc>) -> StorageResult<Option<u32>>;

    /// Delete up to `limit` events with `id <= max_id`, sentinel excluded.
    async fn delete_events_through(&mut self, max_id: u32, limit: u32) -> StorageResult<u64>;

    /// Mark `Unknown` events created before `before` as `Failed`.
    async fn fail_stale_events(&mut self, before: DateTime<Utc>) -> StorageResult<u64>;

    // -- strategies ----------------------------------------------------------

    async fn insert_strategy(&mut self, row: &StrategyRow) -> StorageResult<()>;

    async fn get_strategy(&mut self, biz_id: u32, id: u32) -> StorageResult<Option<StrategyRow>>;

    /// `SELECT ... FOR UPDATE`: holds the row until the transaction ends.
    async fn get_strategy_for_update(
        &mut self,
        biz_id: u32,
        id: u32,
    ) -> StorageResult<Option<StrategyRow>>;

    /// `UPDATE strategies SET pub_state = to WHERE <ref> AND <guard>`.
    /// Returns rows affected.
    async fn transition_pub_state(
        &mut self,
        target: &StrategyRef,
        guard: PubStateGuard,
        to: PubState,
        reviser: &str,
    ) -> StorageResult<u64>;

    async fn delete_strategy(&mut self, biz_id: u32, id: u32) -> StorageResult<u64>;

    // -- current_published_strategies ---------------------------------------

    async fn get_current_published(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<Option<CurrentPublishedStrategyRow>>;

    /// Fails with `DuplicateKey` when a row for the strategy exists.
    async fn insert_current_published(
        &mut self,
        row: &CurrentPublishedStrategyRow,
    ) -> StorageResult<()>;

    /// Update spec, revision and timestamps in place. Returns rows affected.
    async fn update_current_published(
        &mut self,
        row: &CurrentPublishedStrategyRow,
    ) -> StorageResult<u64>;

    async fn delete_current_published(&mut self, biz_id: u32, strategy_id: u32)
        -> StorageResult<u64>;

    async fn list_current_published(
        &mut self,
        biz_id: u32,
        app_id: u32,
        page: Page,
    ) -> StorageResult<Vec<CurrentPublishedStrategyRow>>;

    async fn count_current_published(&mut self, biz_id: u32, app_id: u32) -> StorageResult<u64>;

    /// All current-published ids of an app, ascending.
    async fn current_published_ids(&mut self, biz_id: u32, app_id: u32)
        -> StorageResult<Vec<u32>>;

    // -- published_strategy_histories ---------------------------------------

    async fn insert_history(&mut self, row: &PublishedStrategyHistoryRow) -> StorageResult<()>;

    /// History of a strategy, oldest first.
    async fn list_history(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<Vec<PublishedStrategyHistoryRow>>;

    // -- audits --------------------------------------------------------------

    async fn insert_audit(&mut self, row: &AuditRow) -> StorageResult<()>;

    /// Audits of one resource, oldest first.
    async fn list_audits(
        &mut self,
        biz_id: u32,
        res_type: &str,
        res_id: u32,
    ) -> StorageResult<Vec<AuditRow>>;

    // -- lifecycle -----------------------------------------------------------

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Maps tenants onto shards.
///
/// Each shard owns its own events table and cursor reminder; the admin shard
/// additionally owns the id counters.
pub trait ShardResolver: Send + Sync {
    /// The shard holding a tenant's data.
    fn sharding_one(&self, biz_id: u32) -> Arc<dyn Shard>;

    /// The shard holding cross-tenant tables (id counters).
    fn admin(&self) -> Arc<dyn Shard>;

    /// Look a shard up by id.
    fn by_id(&self, shard_id: u32) -> Option<Arc<dyn Shard>>;

    /// Every distinct shard, admin included.
    fn all(&self) -> Vec<Arc<dyn Shard>>;
}

/// Resolver over a fixed list of shards, assigning tenants by `biz_id % n`.
#[derive(Clone)]
pub struct StaticShardResolver {
    admin: Arc<dyn Shard>,
    shards: Vec<Arc<dyn Shard>>,
}

impl StaticShardResolver {
    /// A deployment where one shard holds everything.
    pub fn single(shard: Arc<dyn Shard>) -> Self {
        Self {
            admin: shard.clone(),
            shards: vec![shard],
        }
    }

    /// Tenants are spread over `shards`; `admin` may or may not be among them.
    pub fn new(admin: Arc<dyn Shard>, shards: Vec<Arc<dyn Shard>>) -> StorageResult<Self> {
        if shards.is_empty() {
            return Err(StorageError::Connection(
                "at least one tenant shard is required".to_string(),
            ));
        }
        Ok(Self { admin, shards })
    }
}

impl ShardResolver for StaticShardResolver {
    fn sharding_one(&self, biz_id: u32) -> Arc<dyn Shard> {
        let idx = biz_id as usize % self.shards.len();
        self.shards[idx].clone()
    }

    fn admin(&self) -> Arc<dyn Shard> {
        self.admin.clone()
    }

    fn by_id(&self, shard_id: u32) -> Option<Arc<dyn Shard>> {
        std::iter::once(&self.admin)
            .chain(self.shards.iter())
            .find(|s| s.id() == shard_id)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<dyn Shard>> {
        let mut all = vec![self.admin.clone()];
        for shard in &self.shards {
            if !all.iter().any(|s| s.id() == shard.id()) {
                all.push(shard.clone());
            }
        }
        all
    }
}
