//! Transactional event outbox with cursor-based consumption.
//!
//! Producers `fire` events inside the transaction that changes the business
//! rows, which writes them with final status `Unknown`. Once that
//! transaction has concluded they `finalize` the batch to `Success` or
//! `Failed`. Consumers page through events in id order and persist their
//! position in the cursor reminder row (`id = 1`) of each shard.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cfgplane_store::{
    EventFilter, EventResource, EventRow, FinalStatus, IdKind, OpType, Page, Shard, Txn,
    CURSOR_REMINDER_ID,
};
use chrono::Utc;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::kit::Kit;
use crate::obs;

/// Rows deleted per purge statement.
pub const PURGE_BATCH: u32 = 100;

const DEFAULT_PURGE_PAUSE: Duration = Duration::from_millis(100);
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a producer wants to announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub biz_id: u32,
    pub app_id: u32,
    pub resource: EventResource,
    pub resource_id: u32,
    /// Optional secondary identity, e.g. a release name
    pub resource_uid: String,
    pub op_type: OpType,
}

impl EventSpec {
    pub fn new(
        biz_id: u32,
        app_id: u32,
        resource: EventResource,
        resource_id: u32,
        op_type: OpType,
    ) -> Self {
        Self {
            biz_id,
            app_id,
            resource,
            resource_id,
            resource_uid: String::new(),
            op_type,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.resource_uid = uid.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.biz_id == 0 {
            return Err(Error::InvalidParameter("event biz_id is required".to_string()));
        }
        if self.resource == EventResource::CursorReminder {
            return Err(Error::InvalidParameter(
                "cursor reminder cannot be fired as an event".to_string(),
            ));
        }
        if self.resource_id == 0 {
            return Err(Error::InvalidParameter(format!(
                "{} event resource_id is required",
                self.resource.as_str()
            )));
        }
        Ok(())
    }
}

/// Ids written by one `fire`, and the shard they live on.
#[derive(Clone)]
pub struct FiredEvents {
    ids: Vec<u32>,
    shard: Arc<dyn Shard>,
}

impl FiredEvents {
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn shard_id(&self) -> u32 {
        self.shard.id()
    }
}

impl fmt::Debug for FiredEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiredEvents")
            .field("ids", &self.ids)
            .field("shard", &self.shard.id())
            .finish()
    }
}

#[derive(Clone)]
pub struct EventOutbox {
    ids: IdGenerator,
    purge_pause: Duration,
}

impl EventOutbox {
    pub fn new(ids: IdGenerator) -> Self {
        Self {
            ids,
            purge_pause: DEFAULT_PURGE_PAUSE,
        }
    }

    /// Override the pause between purge batches.
    pub fn with_purge_pause(mut self, pause: Duration) -> Self {
        self.purge_pause = pause;
        self
    }

    /// Write `events` with status `Unknown` in the caller's transaction.
    ///
    /// Call after the business rows are written. The returned handle must be
    /// passed to `finalize` once the transaction has committed or rolled back.
    #[instrument(skip(self, kit, txn, events), fields(rid = %kit.rid, count = events.len()))]
    pub async fn fire(
        &self,
        kit: &Kit,
        txn: &mut dyn Txn,
        events: &[EventSpec],
    ) -> Result<FiredEvents> {
        if events.is_empty() {
            return Err(Error::InvalidParameter("no events to fire".to_string()));
        }
        for event in events {
            event.validate()?;
        }
        let count = u32::try_from(events.len())
            .map_err(|_| Error::InvalidParameter("too many events in one batch".to_string()))?;
        let ids = self.ids.batch(kit, IdKind::Events, count).await?;

        let now = Utc::now();
        let rows: Vec<EventRow> = events
            .iter()
            .zip(&ids)
            .map(|(event, id)| EventRow {
                id: *id,
                biz_id: event.biz_id,
                app_id: event.app_id,
                resource: event.resource,
                resource_id: event.resource_id,
                resource_uid: event.resource_uid.clone(),
                op_type: event.op_type,
                final_status: FinalStatus::Unknown,
                creator: kit.user.clone(),
                created_at: now,
            })
            .collect();
        kit.exec(txn.insert_events(&rows)).await?;

        let shard = txn.shard();
        obs::emit_events_fired(&kit.rid, shard.id(), rows.len());
        Ok(FiredEvents { ids, shard })
    }

    /// Settle fired events after their transaction concluded.
    ///
    /// `Ok` outcomes mark them `Success`, anything else `Failed`. Failures
    /// here are only logged: the owning transaction's fate is already fixed
    /// and the stale-event sweep settles whatever is left `Unknown`.
    pub async fn finalize<T: Sync>(&self, kit: &Kit, fired: &FiredEvents, outcome: &Result<T>) {
        let status = if outcome.is_ok() {
            FinalStatus::Success
        } else {
            FinalStatus::Failed
        };
        let shard_id = fired.shard.id();
        match self.set_status(kit, fired, status).await {
            Ok(updated) => {
                obs::emit_events_finalized(&kit.rid, shard_id, status.as_str(), updated);
                let fired_count = fired.ids.len() as u64;
                if updated < fired_count {
                    obs::emit_finalize_skipped(&kit.rid, shard_id, fired_count - updated);
                }
            }
            Err(e) => obs::emit_finalize_error(&kit.rid, shard_id, &e),
        }
    }

    async fn set_status(&self, kit: &Kit, fired: &FiredEvents, status: FinalStatus) -> Result<u64> {
        let kit = kit.renewed(FINALIZE_TIMEOUT);
        let mut txn = kit.exec(fired.shard.begin()).await?;
        let updated = kit.exec(txn.set_event_status(&fired.ids, status)).await?;
        kit.exec(txn.commit()).await?;
        Ok(updated)
    }

    /// Events with `id > start_cursor`, ascending.
    #[instrument(skip(self, kit, shard), fields(rid = %kit.rid, shard = shard.id()))]
    pub async fn list(
        &self,
        kit: &Kit,
        shard: &dyn Shard,
        start_cursor: u32,
        page: Page,
    ) -> Result<Vec<EventRow>> {
        let filter = EventFilter {
            after: Some(start_cursor),
            ..Default::default()
        };
        self.select(kit, shard, &filter, page).await
    }

    /// Events with `id <= cursor`, ascending: those a consumer has moved past.
    #[instrument(skip(self, kit, shard), fields(rid = %kit.rid, shard = shard.id()))]
    pub async fn list_consumed_events(
        &self,
        kit: &Kit,
        shard: &dyn Shard,
        cursor: u32,
        page: Page,
    ) -> Result<Vec<EventRow>> {
        let filter = EventFilter {
            through: Some(cursor),
            ..Default::default()
        };
        self.select(kit, shard, &filter, page).await
    }

    async fn select(
        &self,
        kit: &Kit,
        shard: &dyn Shard,
        filter: &EventFilter,
        page: Page,
    ) -> Result<Vec<EventRow>> {
        if !page.is_valid() {
            return Err(Error::InvalidParameter(format!(
                "page limit must be within 1..={}",
                Page::MAX_LIMIT
            )));
        }
        let mut txn = kit.exec(shard.begin()).await?;
        let rows = kit.exec(txn.list_events(filter, page)).await?;
        kit.exec(txn.commit()).await?;
        Ok(rows)
    }

    /// The last consumed event id recorded on `shard`, 0 when none.
    pub async fn latest_cursor(&self, kit: &Kit, shard: &dyn Shard) -> Result<u32> {
        let mut txn = kit.exec(shard.begin()).await?;
        let reminder = kit.exec(txn.get_event(CURSOR_REMINDER_ID)).await?;
        kit.exec(txn.commit()).await?;
        Ok(reminder.map_or(0, |row| row.resource_id))
    }

    /// Persist `cursor` as the last consumed event id. Last write wins.
    #[instrument(skip(self, kit, shard), fields(rid = %kit.rid, shard = shard.id()))]
    pub async fn record_cursor(&self, kit: &Kit, shard: &dyn Shard, cursor: u32) -> Result<()> {
        let mut txn = kit.exec(shard.begin()).await?;
        kit.exec(txn.upsert_cursor_reminder(cursor, Utc::now()))
            .await?;
        kit.exec(txn.commit()).await?;
        obs::emit_cursor_recorded(&kit.rid, shard.id(), cursor);
        Ok(())
    }

    /// Delete events older than `days_ago` days in small batches.
    ///
    /// Returns the number of rows deleted. The cursor reminder is kept.
    #[instrument(skip(self, kit, shard), fields(rid = %kit.rid, shard = shard.id()))]
    pub async fn purge(&self, kit: &Kit, shard: &dyn Shard, days_ago: u32) -> Result<u64> {
        let before = Utc::now() - chrono::Duration::days(i64::from(days_ago));

        let mut txn = kit.exec(shard.begin()).await?;
        let newest = kit.exec(txn.newest_event_before(before)).await?;
        kit.exec(txn.commit()).await?;
        let Some(through) = newest else {
            return Ok(0);
        };

        let mut total = 0;
        loop {
            let mut txn = kit.exec(shard.begin()).await?;
            let deleted = kit
                .exec(txn.delete_events_through(through, PURGE_BATCH))
                .await?;
            kit.exec(txn.commit()).await?;
            total += deleted;
            if deleted < u64::from(PURGE_BATCH) {
                break;
            }
            tokio::time::sleep(self.purge_pause).await;
        }

        obs::emit_purge_finished(&kit.rid, shard.id(), through, total);
        Ok(total)
    }

    /// Mark events still `Unknown` after `older_than` as `Failed`.
    ///
    /// Covers producers that died between commit and finalize. Returns the
    /// number of events failed.
    #[instrument(skip(self, kit, shard), fields(rid = %kit.rid, shard = shard.id()))]
    pub async fn sweep_unknown(
        &self,
        kit: &Kit,
        shard: &dyn Shard,
        older_than: Duration,
    ) -> Result<u64> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::InvalidParameter(format!("sweep age: {}", e)))?;
        let before = Utc::now() - age;

        let mut txn = kit.exec(shard.begin()).await?;
        let failed = kit.exec(txn.fail_stale_events(before)).await?;
        kit.exec(txn.commit()).await?;
        obs::emit_unknown_swept(&kit.rid, shard.id(), failed);
        Ok(failed)
    }
}
