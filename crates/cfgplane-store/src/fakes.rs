//! In-memory shard (testing and single-process use)
//!
//! `MemoryShard` satisfies the `Shard`/`Txn` contracts without an external
//! database. Each row slot keeps its committed value plus at most one pending
//! value owned by an open transaction, which gives the row-lock behaviour the
//! primitives rely on:
//! - a transaction sees its own pending writes, everyone else sees the
//!   committed value (uncommitted inserts are invisible);
//! - writing a row another open transaction holds waits until that
//!   transaction commits or rolls back, up to the lock-wait timeout;
//! - inserting over a visible row fails with `DuplicateKey`.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

type TxnId = u64;

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Row slots
// ---------------------------------------------------------------------------

enum Conflict {
    /// Another open transaction holds the row; wait and retry.
    Blocked,
    Duplicate { table: &'static str, key: String },
    Corrupt { table: &'static str, reason: String },
}

#[derive(Debug)]
struct Slot<V> {
    committed: Option<V>,
    pending: Option<(TxnId, Option<V>)>,
}

impl<V> Slot<V> {
    fn visible(&self, txn: TxnId) -> Option<&V> {
        match &self.pending {
            Some((owner, value)) if *owner == txn => value.as_ref(),
            _ => self.committed.as_ref(),
        }
    }

    fn held_by_other(&self, txn: TxnId) -> bool {
        matches!(&self.pending, Some((owner, _)) if *owner != txn)
    }

    /// A row only another transaction has inserted so far.
    fn foreign_insert(&self, txn: TxnId) -> bool {
        self.committed.is_none() && self.held_by_other(txn)
    }
}

struct Table<K, V> {
    name: &'static str,
    rows: BTreeMap<K, Slot<V>>,
}

impl<K, V> Table<K, V>
where
    K: Ord + Clone + Debug,
    V: Clone,
{
    fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: BTreeMap::new(),
        }
    }

    fn visible(&self, key: &K, txn: TxnId) -> Option<&V> {
        self.rows.get(key).and_then(|slot| slot.visible(txn))
    }

    fn scan(&self, txn: TxnId) -> impl Iterator<Item = (&K, &V)> {
        self.rows
            .iter()
            .filter_map(move |(k, slot)| slot.visible(txn).map(|v| (k, v)))
    }

    fn insert(&mut self, key: K, txn: TxnId, value: V) -> Result<(), Conflict> {
        if let Some(slot) = self.rows.get(&key) {
            if slot.held_by_other(txn) {
                return Err(Conflict::Blocked);
            }
            if slot.visible(txn).is_some() {
                return Err(Conflict::Duplicate {
                    table: self.name,
                    key: format!("{:?}", key),
                });
            }
        }
        let slot = self.rows.entry(key).or_insert(Slot {
            committed: None,
            pending: None,
        });
        slot.pending = Some((txn, Some(value)));
        Ok(())
    }

    /// Apply `f` to the visible row under `key`; `f` returning `None` means the
    /// row does not match and nothing is written. Returns rows affected.
    fn update_with<F>(&mut self, key: &K, txn: TxnId, f: F) -> Result<u64, Conflict>
    where
        F: FnOnce(&V) -> Option<V>,
    {
        let Some(slot) = self.rows.get_mut(key) else {
            return Ok(0);
        };
        if slot.foreign_insert(txn) {
            return Ok(0);
        }
        if slot.held_by_other(txn) {
            return Err(Conflict::Blocked);
        }
        let next = match slot.visible(txn) {
            Some(current) => f(current),
            None => return Ok(0),
        };
        match next {
            Some(value) => {
                slot.pending = Some((txn, Some(value)));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Take the row lock without changing the value.
    fn select_for_update(&mut self, key: &K, txn: TxnId) -> Result<Option<V>, Conflict> {
        let mut found = None;
        self.update_with(key, txn, |current| {
            found = Some(current.clone());
            Some(current.clone())
        })?;
        Ok(found)
    }

    fn delete_where<F>(&mut self, key: &K, txn: TxnId, pred: F) -> Result<u64, Conflict>
    where
        F: FnOnce(&V) -> bool,
    {
        let Some(slot) = self.rows.get_mut(key) else {
            return Ok(0);
        };
        if slot.foreign_insert(txn) {
            return Ok(0);
        }
        if slot.held_by_other(txn) {
            return Err(Conflict::Blocked);
        }
        if !slot.visible(txn).map_or(false, pred) {
            return Ok(0);
        }
        slot.pending = Some((txn, None));
        Ok(1)
    }

    /// Rewrite every key in `keys`, all-or-nothing with respect to row locks.
    fn update_many<F>(&mut self, keys: &[K], txn: TxnId, mut f: F) -> Result<u64, Conflict>
    where
        F: FnMut(&V) -> Option<V>,
    {
        for key in keys {
            if let Some(slot) = self.rows.get(key) {
                if !slot.foreign_insert(txn) && slot.held_by_other(txn) {
                    return Err(Conflict::Blocked);
                }
            }
        }
        let mut affected = 0;
        for key in keys {
            affected += self.update_with(key, txn, &mut f)?;
        }
        Ok(affected)
    }

    fn finish(&mut self, txn: TxnId, commit: bool) {
        self.rows.retain(|_, slot| {
            if matches!(&slot.pending, Some((owner, _)) if *owner == txn) {
                if let Some((_, value)) = slot.pending.take() {
                    if commit {
                        slot.committed = value;
                    }
                }
            }
            slot.committed.is_some() || slot.pending.is_some()
        });
    }
}

struct Tables {
    counters: Table<IdKind, u32>,
    locks: Table<LockKey, ResourceLockRow>,
    events: Table<u32, EventRow>,
    strategies: Table<u32, StrategyRow>,
    current_published: Table<u32, CurrentPublishedStrategyRow>,
    histories: Table<u32, PublishedStrategyHistoryRow>,
    audits: Table<u32, AuditRow>,
}

impl Tables {
    fn new() -> Self {
        Self {
            counters: Table::new("id_generators"),
            locks: Table::new("resource_locks"),
            events: Table::new("events"),
            strategies: Table::new("strategies"),
            current_published: Table::new("current_published_strategies"),
            histories: Table::new("published_strategy_histories"),
            audits: Table::new("audits"),
        }
    }

    fn finish(&mut self, txn: TxnId, commit: bool) {
        self.counters.finish(txn, commit);
        self.locks.finish(txn, commit);
        self.events.finish(txn, commit);
        self.strategies.finish(txn, commit);
        self.current_published.finish(txn, commit);
        self.histories.finish(txn, commit);
        self.audits.finish(txn, commit);
    }
}

fn page_of<T>(rows: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    rows.skip(page.start as usize)
        .take(page.limit as usize)
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryShard
// ---------------------------------------------------------------------------

struct Shared {
    id: u32,
    tables: Mutex<Tables>,
    released: Notify,
    next_txn: AtomicU64,
}

/// In-memory shard with transactional row-lock semantics.
#[derive(Clone)]
pub struct MemoryShard {
    shared: Arc<Shared>,
    lock_wait: Duration,
}

impl MemoryShard {
    /// A shard with every id counter seeded.
    pub fn new(id: u32) -> Self {
        let shard = Self::unseeded(id);
        if let Ok(mut tables) = shard.shared.tables.lock() {
            for kind in IdKind::ALL {
                tables.counters.rows.insert(
                    kind,
                    Slot {
                        committed: Some(kind.seed_floor()),
                        pending: None,
                    },
                );
            }
        }
        shard
    }

    /// A shard with empty tables, counters included.
    pub fn unseeded(id: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                tables: Mutex::new(Tables::new()),
                released: Notify::new(),
                next_txn: AtomicU64::new(1),
            }),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Override how long a write waits for another transaction's row lock.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }
}

impl std::fmt::Debug for MemoryShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryShard")
            .field("id", &self.shared.id)
            .field("lock_wait", &self.lock_wait)
            .finish()
    }
}

#[async_trait]
impl Shard for MemoryShard {
    fn id(&self) -> u32 {
        self.shared.id
    }

    async fn begin(&self) -> StorageResult<Box<dyn Txn>> {
        let id = self.shared.next_txn.fetch_add(1, Ordering::SeqCst);
        debug!(shard = self.shared.id, txn = id, "memory txn begin");
        Ok(Box::new(MemoryTxn {
            id,
            shard: self.clone(),
            finished: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryTxn
// ---------------------------------------------------------------------------

struct MemoryTxn {
    id: TxnId,
    shard: MemoryShard,
    finished: bool,
}

impl MemoryTxn {
    fn attempt<T, F>(&self, op: &mut F) -> StorageResult<Option<T>>
    where
        F: FnMut(&mut Tables, TxnId) -> Result<T, Conflict>,
    {
        if self.finished {
            return Err(StorageError::TxnFinished);
        }
        let mut tables = self
            .shard
            .shared
            .tables
            .lock()
            .map_err(|_| StorageError::Backend("memory shard poisoned".to_string()))?;
        match op(&mut tables, self.id) {
            Ok(value) => Ok(Some(value)),
            Err(Conflict::Blocked) => Ok(None),
            Err(Conflict::Duplicate { table, key }) => {
                Err(StorageError::DuplicateKey { table, key })
            }
            Err(Conflict::Corrupt { table, reason }) => {
                Err(StorageError::Corrupted { table, reason })
            }
        }
    }

    /// Run `op` under the table mutex, waiting out row locks held by others.
    async fn run<T, F>(&self, table: &'static str, mut op: F) -> StorageResult<T>
    where
        F: FnMut(&mut Tables, TxnId) -> Result<T, Conflict> + Send,
        T: Send,
    {
        let deadline = Instant::now() + self.shard.lock_wait;
        loop {
            let released = self.shard.shared.released.notified();
            if let Some(value) = self.attempt(&mut op)? {
                return Ok(value);
            }
            debug!(txn = self.id, table, "waiting for row lock");
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(StorageError::LockWaitTimeout { table });
            }
        }
    }

    fn finish(&mut self, commit: bool) -> StorageResult<()> {
        if self.finished {
            return Err(StorageError::TxnFinished);
        }
        self.finished = true;
        let result = match self.shard.shared.tables.lock() {
            Ok(mut tables) => {
                tables.finish(self.id, commit);
                Ok(())
            }
            Err(_) => Err(StorageError::Backend("memory shard poisoned".to_string())),
        };
        self.shard.shared.released.notify_waiters();
        result
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        if !self.finished {
            debug!(txn = self.id, "memory txn dropped, rolling back");
            let _ = self.finish(false);
        }
    }
}

#[async_trait]
impl Txn for MemoryTxn {
    fn shard(&self) -> Arc<dyn Shard> {
        Arc::new(self.shard.clone())
    }

    // -- id_generators -------------------------------------------------------

    async fn seed_counter(&mut self, kind: IdKind, floor: u32) -> StorageResult<()> {
        self.run("id_generators", |t, txn| {
            if t.counters.visible(&kind, txn).is_some() {
                return Ok(());
            }
            match t.counters.insert(kind, txn, floor) {
                Err(Conflict::Duplicate { .. }) => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn bump_counter(&mut self, kind: IdKind, step: u32) -> StorageResult<u64> {
        self.run("id_generators", |t, txn| {
            if let Some(current) = t.counters.visible(&kind, txn) {
                if current.checked_add(step).is_none() {
                    return Err(Conflict::Corrupt {
                        table: "id_generators",
                        reason: format!("counter {} overflows", kind),
                    });
                }
            }
            t.counters.update_with(&kind, txn, |max| Some(max + step))
        })
        .await
    }

    async fn read_counter(&mut self, kind: IdKind) -> StorageResult<Option<u32>> {
        self.run("id_generators", |t, txn| {
            Ok(t.counters.visible(&kind, txn).copied())
        })
        .await
    }

    // -- resource_locks ------------------------------------------------------

    async fn increment_lock(&mut self, key: &LockKey) -> StorageResult<u64> {
        self.run("resource_locks", |t, txn| {
            t.locks.update_with(key, txn, |row| {
                let mut next = row.clone();
                next.res_count += 1;
                Some(next)
            })
        })
        .await
    }

    async fn lock_count_for_update(&mut self, key: &LockKey) -> StorageResult<Option<u32>> {
        self.run("resource_locks", |t, txn| {
            Ok(t.locks.select_for_update(key, txn)?.map(|row| row.res_count))
        })
        .await
    }

    async fn insert_lock(&mut self, row: &ResourceLockRow) -> StorageResult<()> {
        self.run("resource_locks", |t, txn| {
            t.locks.insert(row.key.clone(), txn, row.clone())
        })
        .await
    }

    async fn decrement_lock(&mut self, key: &LockKey) -> StorageResult<u64> {
        self.run("resource_locks", |t, txn| {
            t.locks.update_with(key, txn, |row| {
                (row.res_count > 1).then(|| {
                    let mut next = row.clone();
                    next.res_count -= 1;
                    next
                })
            })
        })
        .await
    }

    async fn delete_lock(&mut self, key: &LockKey) -> StorageResult<u64> {
        self.run("resource_locks", |t, txn| {
            t.locks.delete_where(key, txn, |_| true)
        })
        .await
    }

    // -- events --------------------------------------------------------------

    async fn insert_events(&mut self, rows: &[EventRow]) -> StorageResult<()> {
        self.run("events", |t, txn| {
            for row in rows {
                if let Some(slot) = t.events.rows.get(&row.id) {
                    if slot.held_by_other(txn) {
                        return Err(Conflict::Blocked);
                    }
                }
            }
            for row in rows {
                t.events.insert(row.id, txn, row.clone())?;
            }
            Ok(())
        })
        .await
    }

    async fn set_event_status(&mut self, ids: &[u32], status: FinalStatus) -> StorageResult<u64> {
        self.run("events", |t, txn| {
            t.events.update_many(ids, txn, |row| {
                (row.final_status == FinalStatus::Unknown).then(|| {
                    let mut next = row.clone();
                    next.final_status = status;
                    next
                })
            })
        })
        .await
    }

    async fn list_events(
        &mut self,
        filter: &EventFilter,
        page: Page,
    ) -> StorageResult<Vec<EventRow>> {
        self.run("events", |t, txn| {
            Ok(page_of(
                t.events
                    .scan(txn)
                    .map(|(_, row)| row)
                    .filter(|row| filter.admits(row))
                    .cloned(),
                page,
            ))
        })
        .await
    }

    async fn get_event(&mut self, id: u32) -> StorageResult<Option<EventRow>> {
        self.run("events", |t, txn| Ok(t.events.visible(&id, txn).cloned()))
            .await
    }

    async fn upsert_cursor_reminder(
        &mut self,
        cursor: u32,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.run("events", |t, txn| {
            let updated = t.events.update_with(&CURSOR_REMINDER_ID, txn, |row| {
                let mut next = row.clone();
                next.resource_id = cursor;
                next.created_at = at;
                Some(next)
            })?;
            if updated == 0 {
                t.events
                    .insert(CURSOR_REMINDER_ID, txn, EventRow::cursor_reminder(cursor, at))?;
            }
            Ok(())
        })
        .await
    }

    async fn newest_event_before(&mut self, before: DateTime<Utc>) -> StorageResult<Option<u32>> {
        self.run("events", |t, txn| {
            Ok(t.events
                .scan(txn)
                .map(|(_, row)| row)
                .filter(|row| row.id != CURSOR_REMINDER_ID && row.created_at < before)
                .map(|row| row.id)
                .max())
        })
        .await
    }

    async fn delete_events_through(&mut self, max_id: u32, limit: u32) -> StorageResult<u64> {
        self.run("events", |t, txn| {
            let doomed: Vec<u32> = t
                .events
                .scan(txn)
                .map(|(id, _)| *id)
                .filter(|id| *id != CURSOR_REMINDER_ID && *id <= max_id)
                .take(limit as usize)
                .collect();
            for id in &doomed {
                if let Some(slot) = t.events.rows.get(id) {
                    if slot.held_by_other(txn) {
                        return Err(Conflict::Blocked);
                    }
                }
            }
            let mut deleted = 0;
            for id in &doomed {
                deleted += t.events.delete_where(id, txn, |_| true)?;
            }
            Ok(deleted)
        })
        .await
    }

    async fn fail_stale_events(&mut self, before: DateTime<Utc>) -> StorageResult<u64> {
        self.run("events", |t, txn| {
            let stale: Vec<u32> = t
                .events
                .scan(txn)
                .map(|(_, row)| row)
                .filter(|row| {
                    row.id != CURSOR_REMINDER_ID
                        && row.final_status == FinalStatus::Unknown
                        && row.created_at < before
                })
                .map(|row| row.id)
                .collect();
            t.events.update_many(&stale, txn, |row| {
                let mut next = row.clone();
                next.final_status = FinalStatus::Failed;
                Some(next)
            })
        })
        .await
    }

    // -- strategies ----------------------------------------------------------

    async fn insert_strategy(&mut self, row: &StrategyRow) -> StorageResult<()> {
        self.run("strategies", |t, txn| {
            t.strategies.insert(row.id, txn, row.clone())
        })
        .await
    }

    async fn get_strategy(&mut self, biz_id: u32, id: u32) -> StorageResult<Option<StrategyRow>> {
        self.run("strategies", |t, txn| {
            Ok(t.strategies
                .visible(&id, txn)
                .filter(|row| row.biz_id == biz_id)
                .cloned())
        })
        .await
    }

    async fn get_strategy_for_update(
        &mut self,
        biz_id: u32,
        id: u32,
    ) -> StorageResult<Option<StrategyRow>> {
        self.run("strategies", |t, txn| {
            Ok(t.strategies
                .select_for_update(&id, txn)?
                .filter(|row| row.biz_id == biz_id))
        })
        .await
    }

    async fn transition_pub_state(
        &mut self,
        target: &StrategyRef,
        guard: PubStateGuard,
        to: PubState,
        reviser: &str,
    ) -> StorageResult<u64> {
        self.run("strategies", |t, txn| {
            t.strategies.update_with(&target.id, txn, |row| {
                let matches = row.biz_id == target.biz_id
                    && row.app_id == target.app_id
                    && guard.admits(row.pub_state);
                matches.then(|| {
                    let mut next = row.clone();
                    next.pub_state = to;
                    next.reviser = reviser.to_string();
                    next.updated_at = Utc::now();
                    next
                })
            })
        })
        .await
    }

    async fn delete_strategy(&mut self, biz_id: u32, id: u32) -> StorageResult<u64> {
        self.run("strategies", |t, txn| {
            t.strategies.delete_where(&id, txn, |row| row.biz_id == biz_id)
        })
        .await
    }

    // -- current_published_strategies ---------------------------------------

    async fn get_current_published(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<Option<CurrentPublishedStrategyRow>> {
        self.run("current_published_strategies", |t, txn| {
            Ok(t.current_published
                .visible(&strategy_id, txn)
                .filter(|row| row.biz_id == biz_id)
                .cloned())
        })
        .await
    }

    async fn insert_current_published(
        &mut self,
        row: &CurrentPublishedStrategyRow,
    ) -> StorageResult<()> {
        self.run("current_published_strategies", |t, txn| {
            t.current_published.insert(row.strategy_id, txn, row.clone())
        })
        .await
    }

    async fn update_current_published(
        &mut self,
        row: &CurrentPublishedStrategyRow,
    ) -> StorageResult<u64> {
        self.run("current_published_strategies", |t, txn| {
            t.current_published.update_with(&row.strategy_id, txn, |current| {
                (current.id == row.id && current.biz_id == row.biz_id).then(|| {
                    let mut next = current.clone();
                    next.spec = row.spec.clone();
                    next.revision = row.revision;
                    next.updated_at = row.updated_at;
                    next
                })
            })
        })
        .await
    }

    async fn delete_current_published(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<u64> {
        self.run("current_published_strategies", |t, txn| {
            t.current_published
                .delete_where(&strategy_id, txn, |row| row.biz_id == biz_id)
        })
        .await
    }

    async fn list_current_published(
        &mut self,
        biz_id: u32,
        app_id: u32,
        page: Page,
    ) -> StorageResult<Vec<CurrentPublishedStrategyRow>> {
        self.run("current_published_strategies", |t, txn| {
            let mut rows: Vec<CurrentPublishedStrategyRow> = t
                .current_published
                .scan(txn)
                .map(|(_, row)| row)
                .filter(|row| row.biz_id == biz_id && row.app_id == app_id)
                .cloned()
                .collect();
            rows.sort_by_key(|row| row.id);
            Ok(page_of(rows.into_iter(), page))
        })
        .await
    }

    async fn count_current_published(&mut self, biz_id: u32, app_id: u32) -> StorageResult<u64> {
        self.run("current_published_strategies", |t, txn| {
            Ok(t.current_published
                .scan(txn)
                .filter(|(_, row)| row.biz_id == biz_id && row.app_id == app_id)
                .count() as u64)
        })
        .await
    }

    async fn current_published_ids(
        &mut self,
        biz_id: u32,
        app_id: u32,
    ) -> StorageResult<Vec<u32>> {
        self.run("current_published_strategies", |t, txn| {
            let mut ids: Vec<u32> = t
                .current_published
                .scan(txn)
                .map(|(_, row)| row)
                .filter(|row| row.biz_id == biz_id && row.app_id == app_id)
                .map(|row| row.id)
                .collect();
            ids.sort_unstable();
            Ok(ids)
        })
        .await
    }

    // -- published_strategy_histories ---------------------------------------

    async fn insert_history(&mut self, row: &PublishedStrategyHistoryRow) -> StorageResult<()> {
        self.run("published_strategy_histories", |t, txn| {
            t.histories.insert(row.id, txn, row.clone())
        })
        .await
    }

    async fn list_history(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<Vec<PublishedStrategyHistoryRow>> {
        self.run("published_strategy_histories", |t, txn| {
            Ok(t.histories
                .scan(txn)
                .map(|(_, row)| row)
                .filter(|row| row.biz_id == biz_id && row.strategy_id == strategy_id)
                .cloned()
                .collect())
        })
        .await
    }

    // -- audits --------------------------------------------------------------

    async fn insert_audit(&mut self, row: &AuditRow) -> StorageResult<()> {
        self.run("audits", |t, txn| t.audits.insert(row.id, txn, row.clone()))
            .await
    }

    async fn list_audits(
        &mut self,
        biz_id: u32,
        res_type: &str,
        res_id: u32,
    ) -> StorageResult<Vec<AuditRow>> {
        self.run("audits", |t, txn| {
            Ok(t.audits
                .scan(txn)
                .map(|(_, row)| row)
                .filter(|row| {
                    row.biz_id == biz_id && row.res_type == res_type && row.res_id == res_id
                })
                .cloned()
                .collect())
        })
        .await
    }

    // -- lifecycle -----------------------------------------------------------

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut txn = self;
        debug!(txn = txn.id, "memory txn commit");
        txn.finish(true)
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut txn = self;
        debug!(txn = txn.id, "memory txn rollback");
        txn.finish(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LockKey {
        LockKey::new(1, "strategy_count", "set-1")
    }

    fn lock_row(id: u32) -> ResourceLockRow {
        ResourceLockRow {
            id,
            key: key(),
            res_count: 1,
        }
    }

    #[tokio::test]
    async fn uncommitted_rows_are_invisible_to_others() {
        let shard = MemoryShard::new(1);
        let mut writer = shard.begin().await.unwrap();
        writer.insert_lock(&lock_row(1)).await.unwrap();

        let mut reader = shard.begin().await.unwrap();
        assert_eq!(reader.increment_lock(&key()).await.unwrap(), 0);
        reader.rollback().await.unwrap();

        writer.commit().await.unwrap();
        let mut reader = shard.begin().await.unwrap();
        assert_eq!(reader.increment_lock(&key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let shard = MemoryShard::new(1);
        let mut txn = shard.begin().await.unwrap();
        txn.insert_lock(&lock_row(1)).await.unwrap();
        txn.rollback().await.unwrap();

        let mut txn = shard.begin().await.unwrap();
        assert_eq!(txn.lock_count_for_update(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_txn_rolls_back() {
        let shard = MemoryShard::new(1);
        {
            let mut txn = shard.begin().await.unwrap();
            txn.insert_lock(&lock_row(1)).await.unwrap();
        }
        let mut txn = shard.begin().await.unwrap();
        txn.insert_lock(&lock_row(2)).await.unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn insert_waits_for_foreign_insert_then_reports_duplicate() {
        let shard = MemoryShard::new(1);
        let mut first = shard.begin().await.unwrap();
        first.insert_lock(&lock_row(1)).await.unwrap();

        let second_shard = shard.clone();
        let waiter = tokio::spawn(async move {
            let mut second = second_shard.begin().await.unwrap();
            second.insert_lock(&lock_row(2)).await
        });

        tokio::task::yield_now().await;
        first.commit().await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn lock_wait_times_out() {
        let shard = MemoryShard::new(1).with_lock_wait(Duration::from_millis(20));
        let mut holder = shard.begin().await.unwrap();
        holder.bump_counter(IdKind::Strategies, 1).await.unwrap();

        let mut other = shard.begin().await.unwrap();
        let err = other.bump_counter(IdKind::Strategies, 1).await.unwrap_err();
        assert!(matches!(err, StorageError::LockWaitTimeout { .. }));
    }

    #[tokio::test]
    async fn unseeded_counter_updates_nothing() {
        let shard = MemoryShard::unseeded(1);
        let mut txn = shard.begin().await.unwrap();
        assert_eq!(txn.bump_counter(IdKind::Events, 1).await.unwrap(), 0);
        txn.seed_counter(IdKind::Events, 1).await.unwrap();
        assert_eq!(txn.bump_counter(IdKind::Events, 1).await.unwrap(), 1);
        assert_eq!(txn.read_counter(IdKind::Events).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn txn_reports_its_shard() {
        let shard = MemoryShard::new(7);
        let txn = shard.begin().await.unwrap();
        assert_eq!(txn.shard().id(), 7);
        txn.commit().await.unwrap();
    }
}
