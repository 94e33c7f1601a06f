//! Shard contract tests against a live PostgreSQL.
//!
//! To run locally:
//!   export CFGPLANE_TEST_DB_URL=postgres://postgres@localhost/cfgplane_test
//!   cargo test -p cfgplane-store --test pg_contracts -- --ignored

mod common;

use cfgplane_store::migrations::{init_schema, seed_counters};
use cfgplane_store::{DbConfig, IdKind, PgShard, Shard};

async fn test_shard() -> PgShard {
    let _ = dotenvy::dotenv();
    let url = std::env::var("CFGPLANE_TEST_DB_URL").expect("CFGPLANE_TEST_DB_URL not set");
    let shard = PgShard::connect(0, &DbConfig::from_url(url)).unwrap();
    init_schema(shard.pool()).await.unwrap();
    seed_counters(&shard).await.unwrap();
    shard
}

/// Ids and tenants unique to this run so reruns do not collide.
fn run_base() -> u32 {
    let millis = chrono::Utc::now().timestamp_millis() as u64;
    ((millis % 100_000) as u32) * 10_000 + 10_000
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_counters_are_seeded() {
    let shard = test_shard().await;
    let mut txn = shard.begin().await.unwrap();
    assert_eq!(txn.bump_counter(IdKind::Audits, 1).await.unwrap(), 1);
    assert!(txn.read_counter(IdKind::Events).await.unwrap().unwrap() >= 1);
    txn.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_uncommitted_writes_are_invisible() {
    common::uncommitted_writes_are_invisible(&test_shard().await, run_base()).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_duplicate_lock_insert_is_reported() {
    common::duplicate_lock_insert_is_reported(&test_shard().await, run_base() + 100).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_decrement_never_drops_below_one() {
    common::decrement_never_drops_below_one(&test_shard().await, run_base() + 200).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_events_list_in_id_order() {
    common::events_list_in_id_order(&test_shard().await, run_base() + 300).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_pub_state_transition_is_guarded() {
    common::pub_state_transition_is_guarded(&test_shard().await, run_base() + 400).await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (CFGPLANE_TEST_DB_URL)"]
async fn pg_current_published_is_unique_per_strategy() {
    common::current_published_is_unique_per_strategy(&test_shard().await, run_base() + 500).await;
}
