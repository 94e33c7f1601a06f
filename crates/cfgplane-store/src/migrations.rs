//! PostgreSQL schema migrations and counter seeding
//!
//! `init_schema` creates every table with its unique keys and indexes. It is
//! idempotent and safe to call on every start. `seed_counters` works against
//! any `Shard` so the in-memory backend shares the same bootstrap path.

use deadpool_postgres::Pool;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::schema::IdKind;
use crate::storage_traits::{Shard, StorageResult};

/// Initialize all cfgplane tables on the shard behind `pool`.
#[instrument(skip_all)]
pub async fn init_schema(pool: &Pool) -> StorageResult<()> {
    info!("initializing cfgplane schema");
    let client = pool.get().await?;

    for (table, ddl) in [
        ("id_generators", ID_GENERATORS),
        ("resource_locks", RESOURCE_LOCKS),
        ("events", EVENTS),
        ("strategies", STRATEGIES),
        ("current_published_strategies", CURRENT_PUBLISHED_STRATEGIES),
        ("published_strategy_histories", PUBLISHED_STRATEGY_HISTORIES),
        ("audits", AUDITS),
    ] {
        debug!(table, "initializing table");
        client
            .batch_execute(ddl)
            .await
            .map_err(|e| StorageError::Schema(format!("{}: {}", table, e)))?;
    }

    info!("cfgplane schema initialization complete");
    Ok(())
}

/// Insert every id counter at its floor unless it already exists.
///
/// Must run against the admin shard before any id is allocated.
#[instrument(skip_all, fields(shard = shard.id()))]
pub async fn seed_counters(shard: &dyn Shard) -> StorageResult<()> {
    let mut txn = shard.begin().await?;
    for kind in IdKind::ALL {
        txn.seed_counter(kind, kind.seed_floor()).await?;
    }
    txn.commit().await?;
    info!(kinds = IdKind::ALL.len(), "id counters seeded");
    Ok(())
}

/// `resource` is the owning table name; `max_id` the last id handed out.
const ID_GENERATORS: &str = r#"
    CREATE TABLE IF NOT EXISTS id_generators (
        id          BIGSERIAL PRIMARY KEY,
        resource    TEXT NOT NULL UNIQUE,
        max_id      BIGINT NOT NULL DEFAULT 0,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    );
"#;

/// `(biz_id, res_type, res_key)` is the slot identity; rows never hold a
/// count below 1.
const RESOURCE_LOCKS: &str = r#"
    CREATE TABLE IF NOT EXISTS resource_locks (
        id          BIGINT PRIMARY KEY,
        biz_id      BIGINT NOT NULL,
        res_type    TEXT NOT NULL,
        res_key     TEXT NOT NULL,
        res_count   INTEGER NOT NULL CHECK (res_count >= 1),
        UNIQUE (biz_id, res_type, res_key)
    );
"#;

/// Row id 1 is reserved for the cursor reminder.
const EVENTS: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id            BIGINT PRIMARY KEY,
        biz_id        BIGINT NOT NULL,
        app_id        BIGINT NOT NULL,
        resource      TEXT NOT NULL,
        resource_id   BIGINT NOT NULL,
        resource_uid  TEXT NOT NULL DEFAULT '',
        op_type       TEXT NOT NULL,
        final_status  TEXT NOT NULL,
        creator       TEXT NOT NULL,
        created_at    TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_biz_id ON events (biz_id, id);
    CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at);
    CREATE INDEX IF NOT EXISTS idx_events_unknown ON events (final_status, created_at)
        WHERE final_status = 'unknown';
"#;

const STRATEGIES: &str = r#"
    CREATE TABLE IF NOT EXISTS strategies (
        id               BIGINT PRIMARY KEY,
        biz_id           BIGINT NOT NULL,
        app_id           BIGINT NOT NULL,
        strategy_set_id  BIGINT NOT NULL,
        release_id       BIGINT NOT NULL,
        name             TEXT NOT NULL,
        as_default       BOOLEAN NOT NULL DEFAULT FALSE,
        namespace        TEXT NOT NULL DEFAULT '',
        scope            JSONB NOT NULL DEFAULT '{}'::jsonb,
        memo             TEXT NOT NULL DEFAULT '',
        pub_state        TEXT NOT NULL,
        creator          TEXT NOT NULL,
        reviser          TEXT NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_strategies_app ON strategies (biz_id, app_id);
"#;

/// One row per strategy; `strategy_id` is the upsert key.
const CURRENT_PUBLISHED_STRATEGIES: &str = r#"
    CREATE TABLE IF NOT EXISTS current_published_strategies (
        id           BIGINT PRIMARY KEY,
        biz_id       BIGINT NOT NULL,
        app_id       BIGINT NOT NULL,
        strategy_id  BIGINT NOT NULL UNIQUE,
        spec         JSONB NOT NULL,
        revision     BIGINT NOT NULL,
        creator      TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cps_app ON current_published_strategies (biz_id, app_id, id);
"#;

const PUBLISHED_STRATEGY_HISTORIES: &str = r#"
    CREATE TABLE IF NOT EXISTS published_strategy_histories (
        id           BIGINT PRIMARY KEY,
        biz_id       BIGINT NOT NULL,
        app_id       BIGINT NOT NULL,
        strategy_id  BIGINT NOT NULL,
        spec         JSONB NOT NULL,
        revision     BIGINT NOT NULL,
        creator      TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_psh_strategy
        ON published_strategy_histories (biz_id, strategy_id, id);
"#;

const AUDITS: &str = r#"
    CREATE TABLE IF NOT EXISTS audits (
        id          BIGINT PRIMARY KEY,
        biz_id      BIGINT NOT NULL,
        app_id      BIGINT NOT NULL,
        res_type    TEXT NOT NULL,
        res_id      BIGINT NOT NULL,
        action      TEXT NOT NULL,
        operator    TEXT NOT NULL,
        rid         TEXT NOT NULL,
        detail      JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at  TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audits_resource ON audits (biz_id, res_type, res_id, id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryShard;

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let shard = MemoryShard::unseeded(0);
        seed_counters(&shard).await.unwrap();
        seed_counters(&shard).await.unwrap();

        let mut txn = shard.begin().await.unwrap();
        assert_eq!(txn.read_counter(IdKind::Events).await.unwrap(), Some(1));
        assert_eq!(txn.read_counter(IdKind::Strategies).await.unwrap(), Some(0));
    }
}
