//! PostgreSQL-backed `Shard` implementation
//!
//! Every `Txn` method issues a single parameterized statement on a pooled
//! connection that has an explicit `BEGIN` outstanding. Inserts that may
//! legitimately collide use `ON CONFLICT DO NOTHING` and report
//! `DuplicateKey` on zero affected rows, so a collision never poisons the
//! surrounding transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::handle::DbConfig;
use crate::schema::*;
use crate::storage_traits::*;

const EVENT_COLUMNS: &str = "id, biz_id, app_id, resource, resource_id, resource_uid, \
                             op_type, final_status, creator, created_at";

const STRATEGY_COLUMNS: &str = "id, biz_id, app_id, strategy_set_id, release_id, name, \
                                as_default, namespace, scope, memo, pub_state, creator, \
                                reviser, created_at, updated_at";

const CPS_COLUMNS: &str =
    "id, biz_id, app_id, strategy_id, spec, revision, creator, created_at, updated_at";

const HISTORY_COLUMNS: &str =
    "id, biz_id, app_id, strategy_id, spec, revision, creator, created_at";

const AUDIT_COLUMNS: &str =
    "id, biz_id, app_id, res_type, res_id, action, operator, rid, detail, created_at";

/// A shard backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgShard {
    id: u32,
    pool: Pool,
}

impl PgShard {
    pub fn new(id: u32, pool: Pool) -> Self {
        Self { id, pool }
    }

    /// Build the pool described by `config` and wrap it as shard `id`.
    pub fn connect(id: u32, config: &DbConfig) -> StorageResult<Self> {
        Ok(Self::new(id, config.create_pool()?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Shard for PgShard {
    fn id(&self) -> u32 {
        self.id
    }

    #[instrument(skip(self), fields(shard = self.id))]
    async fn begin(&self) -> StorageResult<Box<dyn Txn>> {
        let client = self.pool.get().await?;
        client
            .batch_execute("BEGIN ISOLATION LEVEL READ COMMITTED")
            .await?;
        debug!("pg txn begin");
        Ok(Box::new(PgTxn {
            shard: self.clone(),
            client: Some(client),
        }))
    }
}

struct PgTxn {
    shard: PgShard,
    client: Option<Object>,
}

impl PgTxn {
    fn client(&self) -> StorageResult<&Object> {
        self.client.as_ref().ok_or(StorageError::TxnFinished)
    }

    async fn finish(&mut self, statement: &str) -> StorageResult<()> {
        let client = self.client.take().ok_or(StorageError::TxnFinished)?;
        client.batch_execute(statement).await?;
        Ok(())
    }
}

impl Drop for PgTxn {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!(error = %e, "rollback of dropped pg txn failed");
                    }
                });
            }
            Err(_) => {
                // No runtime to roll back on: detach the connection from the
                // pool so the open transaction dies with it.
                drop(Object::take(client));
            }
        }
    }
}

// -- value mapping -----------------------------------------------------------

fn to_u32(value: i64, table: &'static str) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::Corrupted {
        table,
        reason: format!("value {} does not fit an id", value),
    })
}

fn parse_label<T>(value: &str, table: &'static str) -> StorageResult<T>
where
    T: std::str::FromStr<Err = UnknownLabel>,
{
    value.parse().map_err(|e: UnknownLabel| StorageError::Corrupted {
        table,
        reason: e.to_string(),
    })
}

fn spec_from_json(value: serde_json::Value, table: &'static str) -> StorageResult<StrategySpec> {
    serde_json::from_value(value).map_err(|e| StorageError::Corrupted {
        table,
        reason: e.to_string(),
    })
}

fn event_from_row(row: &Row) -> StorageResult<EventRow> {
    Ok(EventRow {
        id: to_u32(row.try_get("id")?, "events")?,
        biz_id: to_u32(row.try_get("biz_id")?, "events")?,
        app_id: to_u32(row.try_get("app_id")?, "events")?,
        resource: parse_label(row.try_get("resource")?, "events")?,
        resource_id: to_u32(row.try_get("resource_id")?, "events")?,
        resource_uid: row.try_get("resource_uid")?,
        op_type: parse_label(row.try_get("op_type")?, "events")?,
        final_status: parse_label(row.try_get("final_status")?, "events")?,
        creator: row.try_get("creator")?,
        created_at: row.try_get("created_at")?,
    })
}

fn strategy_from_row(row: &Row) -> StorageResult<StrategyRow> {
    Ok(StrategyRow {
        id: to_u32(row.try_get("id")?, "strategies")?,
        biz_id: to_u32(row.try_get("biz_id")?, "strategies")?,
        app_id: to_u32(row.try_get("app_id")?, "strategies")?,
        strategy_set_id: to_u32(row.try_get("strategy_set_id")?, "strategies")?,
        spec: StrategySpec {
            name: row.try_get("name")?,
            release_id: to_u32(row.try_get("release_id")?, "strategies")?,
            as_default: row.try_get("as_default")?,
            namespace: row.try_get("namespace")?,
            scope: row.try_get("scope")?,
            memo: row.try_get("memo")?,
        },
        pub_state: parse_label(row.try_get("pub_state")?, "strategies")?,
        creator: row.try_get("creator")?,
        reviser: row.try_get("reviser")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cps_from_row(row: &Row) -> StorageResult<CurrentPublishedStrategyRow> {
    const TABLE: &str = "current_published_strategies";
    Ok(CurrentPublishedStrategyRow {
        id: to_u32(row.try_get("id")?, TABLE)?,
        biz_id: to_u32(row.try_get("biz_id")?, TABLE)?,
        app_id: to_u32(row.try_get("app_id")?, TABLE)?,
        strategy_id: to_u32(row.try_get("strategy_id")?, TABLE)?,
        spec: spec_from_json(row.try_get("spec")?, TABLE)?,
        revision: to_u32(row.try_get("revision")?, TABLE)?,
        creator: row.try_get("creator")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &Row) -> StorageResult<PublishedStrategyHistoryRow> {
    const TABLE: &str = "published_strategy_histories";
    Ok(PublishedStrategyHistoryRow {
        id: to_u32(row.try_get("id")?, TABLE)?,
        biz_id: to_u32(row.try_get("biz_id")?, TABLE)?,
        app_id: to_u32(row.try_get("app_id")?, TABLE)?,
        strategy_id: to_u32(row.try_get("strategy_id")?, TABLE)?,
        spec: spec_from_json(row.try_get("spec")?, TABLE)?,
        revision: to_u32(row.try_get("revision")?, TABLE)?,
        creator: row.try_get("creator")?,
        created_at: row.try_get("created_at")?,
    })
}

fn audit_from_row(row: &Row) -> StorageResult<AuditRow> {
    Ok(AuditRow {
        id: to_u32(row.try_get("id")?, "audits")?,
        biz_id: to_u32(row.try_get("biz_id")?, "audits")?,
        app_id: to_u32(row.try_get("app_id")?, "audits")?,
        res_type: row.try_get("res_type")?,
        res_id: to_u32(row.try_get("res_id")?, "audits")?,
        action: row.try_get("action")?,
        operator: row.try_get("operator")?,
        rid: row.try_get("rid")?,
        detail: row.try_get("detail")?,
        created_at: row.try_get("created_at")?,
    })
}

fn duplicate(table: &'static str, key: impl std::fmt::Display) -> StorageError {
    StorageError::DuplicateKey {
        table,
        key: key.to_string(),
    }
}

#[async_trait]
impl Txn for PgTxn {
    fn shard(&self) -> Arc<dyn Shard> {
        Arc::new(self.shard.clone())
    }

    // -- id_generators -------------------------------------------------------

    async fn seed_counter(&mut self, kind: IdKind, floor: u32) -> StorageResult<()> {
        self.client()?
            .execute(
                "INSERT INTO id_generators (resource, max_id, updated_at) \
                 VALUES ($1, $2, now()) ON CONFLICT (resource) DO NOTHING",
                &[&kind.as_str(), &i64::from(floor)],
            )
            .await?;
        Ok(())
    }

    async fn bump_counter(&mut self, kind: IdKind, step: u32) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "UPDATE id_generators SET max_id = max_id + $2, updated_at = now() \
                 WHERE resource = $1",
                &[&kind.as_str(), &i64::from(step)],
            )
            .await?)
    }

    async fn read_counter(&mut self, kind: IdKind) -> StorageResult<Option<u32>> {
        let row = self
            .client()?
            .query_opt(
                "SELECT max_id FROM id_generators WHERE resource = $1",
                &[&kind.as_str()],
            )
            .await?;
        row.map(|r| to_u32(r.try_get("max_id")?, "id_generators"))
            .transpose()
    }

    // -- resource_locks ------------------------------------------------------

    async fn increment_lock(&mut self, key: &LockKey) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "UPDATE resource_locks SET res_count = res_count + 1 \
                 WHERE biz_id = $1 AND res_type = $2 AND res_key = $3",
                &[&i64::from(key.biz_id), &key.res_type, &key.res_key],
            )
            .await?)
    }

    async fn lock_count_for_update(&mut self, key: &LockKey) -> StorageResult<Option<u32>> {
        let row = self
            .client()?
            .query_opt(
                "SELECT res_count FROM resource_locks \
                 WHERE biz_id = $1 AND res_type = $2 AND res_key = $3 FOR UPDATE",
                &[&i64::from(key.biz_id), &key.res_type, &key.res_key],
            )
            .await?;
        row.map(|r| to_u32(i64::from(r.try_get::<_, i32>("res_count")?), "resource_locks"))
            .transpose()
    }

    async fn insert_lock(&mut self, row: &ResourceLockRow) -> StorageResult<()> {
        let count = i32::try_from(row.res_count).map_err(|_| StorageError::Corrupted {
            table: "resource_locks",
            reason: format!("res_count {} out of range", row.res_count),
        })?;
        let inserted = self
            .client()?
            .execute(
                "INSERT INTO resource_locks (id, biz_id, res_type, res_key, res_count) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (biz_id, res_type, res_key) DO NOTHING",
                &[
                    &i64::from(row.id),
                    &i64::from(row.key.biz_id),
                    &row.key.res_type,
                    &row.key.res_key,
                    &count,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(duplicate("resource_locks", &row.key));
        }
        Ok(())
    }

    async fn decrement_lock(&mut self, key: &LockKey) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "UPDATE resource_locks SET res_count = res_count - 1 \
                 WHERE biz_id = $1 AND res_type = $2 AND res_key = $3 AND res_count > 1",
                &[&i64::from(key.biz_id), &key.res_type, &key.res_key],
            )
            .await?)
    }

    async fn delete_lock(&mut self, key: &LockKey) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "DELETE FROM resource_locks \
                 WHERE biz_id = $1 AND res_type = $2 AND res_key = $3",
                &[&i64::from(key.biz_id), &key.res_type, &key.res_key],
            )
            .await?)
    }

    // -- events --------------------------------------------------------------

    async fn insert_events(&mut self, rows: &[EventRow]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        const COLUMNS_PER_ROW: usize = 10;
        let mut values: Vec<Box<dyn ToSql + Sync + Send>> =
            Vec::with_capacity(rows.len() * COLUMNS_PER_ROW);
        let mut tuples = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let base = i * COLUMNS_PER_ROW;
            let placeholders: Vec<String> =
                (1..=COLUMNS_PER_ROW).map(|n| format!("${}", base + n)).collect();
            tuples.push(format!("({})", placeholders.join(", ")));
            values.push(Box::new(i64::from(row.id)));
            values.push(Box::new(i64::from(row.biz_id)));
            values.push(Box::new(i64::from(row.app_id)));
            values.push(Box::new(row.resource.as_str()));
            values.push(Box::new(i64::from(row.resource_id)));
            values.push(Box::new(row.resource_uid.clone()));
            values.push(Box::new(row.op_type.as_str()));
            values.push(Box::new(row.final_status.as_str()));
            values.push(Box::new(row.creator.clone()));
            values.push(Box::new(row.created_at));
        }
        let sql = format!(
            "INSERT INTO events ({}) VALUES {}",
            EVENT_COLUMNS,
            tuples.join(", ")
        );
        let params: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| &**v as &(dyn ToSql + Sync))
            .collect();
        self.client()?.execute(sql.as_str(), &params).await?;
        Ok(())
    }

    async fn set_event_status(&mut self, ids: &[u32], status: FinalStatus) -> StorageResult<u64> {
        let ids: Vec<i64> = ids.iter().map(|id| i64::from(*id)).collect();
        Ok(self
            .client()?
            .execute(
                "UPDATE events SET final_status = $1 \
                 WHERE id = ANY($2) AND final_status = $3",
                &[&status.as_str(), &ids, &FinalStatus::Unknown.as_str()],
            )
            .await?)
    }

    async fn list_events(
        &mut self,
        filter: &EventFilter,
        page: Page,
    ) -> StorageResult<Vec<EventRow>> {
        let sql = format!(
            "SELECT {} FROM events \
             WHERE id <> $1 \
               AND ($2::BIGINT IS NULL OR id > $2) \
               AND ($3::BIGINT IS NULL OR id <= $3) \
               AND ($4::BIGINT IS NULL OR biz_id = $4) \
             ORDER BY id ASC LIMIT $5 OFFSET $6",
            EVENT_COLUMNS
        );
        let rows = self
            .client()?
            .query(
                sql.as_str(),
                &[
                    &i64::from(CURSOR_REMINDER_ID),
                    &filter.after.map(i64::from),
                    &filter.through.map(i64::from),
                    &filter.biz_id.map(i64::from),
                    &i64::from(page.limit),
                    &i64::from(page.start),
                ],
            )
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_event(&mut self, id: u32) -> StorageResult<Option<EventRow>> {
        let sql = format!("SELECT {} FROM events WHERE id = $1", EVENT_COLUMNS);
        let row = self
            .client()?
            .query_opt(sql.as_str(), &[&i64::from(id)])
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn upsert_cursor_reminder(
        &mut self,
        cursor: u32,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let row = EventRow::cursor_reminder(cursor, at);
        let sql = format!(
            "INSERT INTO events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE \
             SET resource_id = EXCLUDED.resource_id, created_at = EXCLUDED.created_at",
            EVENT_COLUMNS
        );
        self.client()?
            .execute(
                sql.as_str(),
                &[
                    &i64::from(row.id),
                    &i64::from(row.biz_id),
                    &i64::from(row.app_id),
                    &row.resource.as_str(),
                    &i64::from(row.resource_id),
                    &row.resource_uid,
                    &row.op_type.as_str(),
                    &row.final_status.as_str(),
                    &row.creator,
                    &row.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn newest_event_before(&mut self, before: DateTime<Utc>) -> StorageResult<Option<u32>> {
        let row = self
            .client()?
            .query_one(
                "SELECT MAX(id) AS max_id FROM events WHERE id <> $1 AND created_at < $2",
                &[&i64::from(CURSOR_REMINDER_ID), &before],
            )
            .await?;
        row.try_get::<_, Option<i64>>("max_id")?
            .map(|id| to_u32(id, "events"))
            .transpose()
    }

    async fn delete_events_through(&mut self, max_id: u32, limit: u32) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "DELETE FROM events WHERE id IN ( \
                     SELECT id FROM events WHERE id <> $1 AND id <= $2 \
                     ORDER BY id ASC LIMIT $3)",
                &[
                    &i64::from(CURSOR_REMINDER_ID),
                    &i64::from(max_id),
                    &i64::from(limit),
                ],
            )
            .await?)
    }

    async fn fail_stale_events(&mut self, before: DateTime<Utc>) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "UPDATE events SET final_status = $1 \
                 WHERE id <> $2 AND final_status = $3 AND created_at < $4",
                &[
                    &FinalStatus::Failed.as_str(),
                    &i64::from(CURSOR_REMINDER_ID),
                    &FinalStatus::Unknown.as_str(),
                    &before,
                ],
            )
            .await?)
    }

    // -- strategies ----------------------------------------------------------

    async fn insert_strategy(&mut self, row: &StrategyRow) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO strategies ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (id) DO NOTHING",
            STRATEGY_COLUMNS
        );
        let inserted = self
            .client()?
            .execute(
                sql.as_str(),
                &[
                    &i64::from(row.id),
                    &i64::from(row.biz_id),
                    &i64::from(row.app_id),
                    &i64::from(row.strategy_set_id),
                    &i64::from(row.spec.release_id),
                    &row.spec.name,
                    &row.spec.as_default,
                    &row.spec.namespace,
                    &row.spec.scope,
                    &row.spec.memo,
                    &row.pub_state.as_str(),
                    &row.creator,
                    &row.reviser,
                    &row.created_at,
                    &row.updated_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(duplicate("strategies", row.id));
        }
        Ok(())
    }

    async fn get_strategy(&mut self, biz_id: u32, id: u32) -> StorageResult<Option<StrategyRow>> {
        let sql = format!(
            "SELECT {} FROM strategies WHERE id = $1 AND biz_id = $2",
            STRATEGY_COLUMNS
        );
        let row = self
            .client()?
            .query_opt(sql.as_str(), &[&i64::from(id), &i64::from(biz_id)])
            .await?;
        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn get_strategy_for_update(
        &mut self,
        biz_id: u32,
        id: u32,
    ) -> StorageResult<Option<StrategyRow>> {
        let sql = format!(
            "SELECT {} FROM strategies WHERE id = $1 AND biz_id = $2 FOR UPDATE",
            STRATEGY_COLUMNS
        );
        let row = self
            .client()?
            .query_opt(sql.as_str(), &[&i64::from(id), &i64::from(biz_id)])
            .await?;
        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn transition_pub_state(
        &mut self,
        target: &StrategyRef,
        guard: PubStateGuard,
        to: PubState,
        reviser: &str,
    ) -> StorageResult<u64> {
        let (sql, guard_state) = match guard {
            PubStateGuard::Is(state) => (
                "UPDATE strategies SET pub_state = $1, reviser = $2, updated_at = now() \
                 WHERE id = $3 AND biz_id = $4 AND app_id = $5 AND pub_state = $6",
                state,
            ),
            PubStateGuard::IsNot(state) => (
                "UPDATE strategies SET pub_state = $1, reviser = $2, updated_at = now() \
                 WHERE id = $3 AND biz_id = $4 AND app_id = $5 AND pub_state <> $6",
                state,
            ),
        };
        Ok(self
            .client()?
            .execute(
                sql,
                &[
                    &to.as_str(),
                    &reviser,
                    &i64::from(target.id),
                    &i64::from(target.biz_id),
                    &i64::from(target.app_id),
                    &guard_state.as_str(),
                ],
            )
            .await?)
    }

    async fn delete_strategy(&mut self, biz_id: u32, id: u32) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "DELETE FROM strategies WHERE id = $1 AND biz_id = $2",
                &[&i64::from(id), &i64::from(biz_id)],
            )
            .await?)
    }

    // -- current_published_strategies ---------------------------------------

    async fn get_current_published(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<Option<CurrentPublishedStrategyRow>> {
        let sql = format!(
            "SELECT {} FROM current_published_strategies \
             WHERE strategy_id = $1 AND biz_id = $2",
            CPS_COLUMNS
        );
        let row = self
            .client()?
            .query_opt(sql.as_str(), &[&i64::from(strategy_id), &i64::from(biz_id)])
            .await?;
        row.as_ref().map(cps_from_row).transpose()
    }

    async fn insert_current_published(
        &mut self,
        row: &CurrentPublishedStrategyRow,
    ) -> StorageResult<()> {
        let spec = serde_json::to_value(&row.spec)?;
        let sql = format!(
            "INSERT INTO current_published_strategies ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (strategy_id) DO NOTHING",
            CPS_COLUMNS
        );
        let inserted = self
            .client()?
            .execute(
                sql.as_str(),
                &[
                    &i64::from(row.id),
                    &i64::from(row.biz_id),
                    &i64::from(row.app_id),
                    &i64::from(row.strategy_id),
                    &spec,
                    &i64::from(row.revision),
                    &row.creator,
                    &row.created_at,
                    &row.updated_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(duplicate("current_published_strategies", row.strategy_id));
        }
        Ok(())
    }

    async fn update_current_published(
        &mut self,
        row: &CurrentPublishedStrategyRow,
    ) -> StorageResult<u64> {
        let spec = serde_json::to_value(&row.spec)?;
        Ok(self
            .client()?
            .execute(
                "UPDATE current_published_strategies \
                 SET spec = $1, revision = $2, updated_at = $3 \
                 WHERE id = $4 AND biz_id = $5",
                &[
                    &spec,
                    &i64::from(row.revision),
                    &row.updated_at,
                    &i64::from(row.id),
                    &i64::from(row.biz_id),
                ],
            )
            .await?)
    }

    async fn delete_current_published(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<u64> {
        Ok(self
            .client()?
            .execute(
                "DELETE FROM current_published_strategies \
                 WHERE strategy_id = $1 AND biz_id = $2",
                &[&i64::from(strategy_id), &i64::from(biz_id)],
            )
            .await?)
    }

    async fn list_current_published(
        &mut self,
        biz_id: u32,
        app_id: u32,
        page: Page,
    ) -> StorageResult<Vec<CurrentPublishedStrategyRow>> {
        let sql = format!(
            "SELECT {} FROM current_published_strategies \
             WHERE biz_id = $1 AND app_id = $2 ORDER BY id ASC LIMIT $3 OFFSET $4",
            CPS_COLUMNS
        );
        let rows = self
            .client()?
            .query(
                sql.as_str(),
                &[
                    &i64::from(biz_id),
                    &i64::from(app_id),
                    &i64::from(page.limit),
                    &i64::from(page.start),
                ],
            )
            .await?;
        rows.iter().map(cps_from_row).collect()
    }

    async fn count_current_published(&mut self, biz_id: u32, app_id: u32) -> StorageResult<u64> {
        let row = self
            .client()?
            .query_one(
                "SELECT COUNT(*) AS total FROM current_published_strategies \
                 WHERE biz_id = $1 AND app_id = $2",
                &[&i64::from(biz_id), &i64::from(app_id)],
            )
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn current_published_ids(
        &mut self,
        biz_id: u32,
        app_id: u32,
    ) -> StorageResult<Vec<u32>> {
        let rows = self
            .client()?
            .query(
                "SELECT id FROM current_published_strategies \
                 WHERE biz_id = $1 AND app_id = $2 ORDER BY id ASC",
                &[&i64::from(biz_id), &i64::from(app_id)],
            )
            .await?;
        rows.iter()
            .map(|r| to_u32(r.try_get("id")?, "current_published_strategies"))
            .collect()
    }

    // -- published_strategy_histories ---------------------------------------

    async fn insert_history(&mut self, row: &PublishedStrategyHistoryRow) -> StorageResult<()> {
        let spec = serde_json::to_value(&row.spec)?;
        let sql = format!(
            "INSERT INTO published_strategy_histories ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            HISTORY_COLUMNS
        );
        self.client()?
            .execute(
                sql.as_str(),
                &[
                    &i64::from(row.id),
                    &i64::from(row.biz_id),
                    &i64::from(row.app_id),
                    &i64::from(row.strategy_id),
                    &spec,
                    &i64::from(row.revision),
                    &row.creator,
                    &row.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_history(
        &mut self,
        biz_id: u32,
        strategy_id: u32,
    ) -> StorageResult<Vec<PublishedStrategyHistoryRow>> {
        let sql = format!(
            "SELECT {} FROM published_strategy_histories \
             WHERE biz_id = $1 AND strategy_id = $2 ORDER BY id ASC",
            HISTORY_COLUMNS
        );
        let rows = self
            .client()?
            .query(sql.as_str(), &[&i64::from(biz_id), &i64::from(strategy_id)])
            .await?;
        rows.iter().map(history_from_row).collect()
    }

    // -- audits --------------------------------------------------------------

    async fn insert_audit(&mut self, row: &AuditRow) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO audits ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            AUDIT_COLUMNS
        );
        self.client()?
            .execute(
                sql.as_str(),
                &[
                    &i64::from(row.id),
                    &i64::from(row.biz_id),
                    &i64::from(row.app_id),
                    &row.res_type,
                    &i64::from(row.res_id),
                    &row.action,
                    &row.operator,
                    &row.rid,
                    &row.detail,
                    &row.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_audits(
        &mut self,
        biz_id: u32,
        res_type: &str,
        res_id: u32,
    ) -> StorageResult<Vec<AuditRow>> {
        let sql = format!(
            "SELECT {} FROM audits \
             WHERE biz_id = $1 AND res_type = $2 AND res_id = $3 ORDER BY id ASC",
            AUDIT_COLUMNS
        );
        let rows = self
            .client()?
            .query(
                sql.as_str(),
                &[&i64::from(biz_id), &res_type, &i64::from(res_id)],
            )
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    // -- lifecycle -----------------------------------------------------------

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut txn = self;
        txn.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut txn = self;
        txn.finish("ROLLBACK").await
    }
}
