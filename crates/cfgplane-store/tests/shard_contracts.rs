//! Shard contract tests against the in-memory backend.
//!
//! The same contracts run against PostgreSQL in `pg_contracts.rs`.

mod common;

use std::sync::Arc;

use cfgplane_store::*;

#[tokio::test]
async fn memory_uncommitted_writes_are_invisible() {
    common::uncommitted_writes_are_invisible(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn memory_duplicate_lock_insert_is_reported() {
    common::duplicate_lock_insert_is_reported(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn memory_decrement_never_drops_below_one() {
    common::decrement_never_drops_below_one(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn memory_events_list_in_id_order() {
    common::events_list_in_id_order(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn memory_stale_unknown_events_fail() {
    common::stale_unknown_events_fail(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn memory_pub_state_transition_is_guarded() {
    common::pub_state_transition_is_guarded(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn memory_current_published_is_unique_per_strategy() {
    common::current_published_is_unique_per_strategy(&MemoryShard::new(0), 100).await;
}

#[tokio::test]
async fn cursor_reminder_is_hidden_from_listings() {
    let shard = MemoryShard::new(0);
    let mut txn = shard.begin().await.unwrap();
    txn.insert_events(&[common::event(5, 1)]).await.unwrap();
    txn.upsert_cursor_reminder(4, chrono::Utc::now()).await.unwrap();
    txn.upsert_cursor_reminder(5, chrono::Utc::now()).await.unwrap();

    let listed = txn
        .list_events(&EventFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, 5);

    let sentinel = txn.get_event(CURSOR_REMINDER_ID).await.unwrap().unwrap();
    assert_eq!(sentinel.resource_id, 5);
    assert_eq!(txn.delete_events_through(10, 100).await.unwrap(), 1);
    assert!(txn.get_event(CURSOR_REMINDER_ID).await.unwrap().is_some());
}

#[tokio::test]
async fn static_resolver_spreads_tenants() {
    let admin: Arc<dyn Shard> = Arc::new(MemoryShard::new(0));
    let a: Arc<dyn Shard> = Arc::new(MemoryShard::new(1));
    let b: Arc<dyn Shard> = Arc::new(MemoryShard::new(2));
    let resolver = StaticShardResolver::new(admin, vec![a, b]).unwrap();

    assert_eq!(resolver.sharding_one(4).id(), 1);
    assert_eq!(resolver.sharding_one(5).id(), 2);
    assert_eq!(resolver.admin().id(), 0);
    assert_eq!(resolver.by_id(2).map(|s| s.id()), Some(2));
    assert!(resolver.by_id(9).is_none());
    assert_eq!(resolver.all().len(), 3);
}

#[tokio::test]
async fn single_resolver_has_one_shard() {
    let resolver = StaticShardResolver::single(Arc::new(MemoryShard::new(3)));
    assert_eq!(resolver.all().len(), 1);
    assert_eq!(resolver.sharding_one(42).id(), 3);
    assert_eq!(resolver.admin().id(), 3);
}
