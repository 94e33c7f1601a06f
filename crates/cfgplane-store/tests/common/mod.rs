//! Behavioural contracts every `Shard` backend must satisfy.
//!
//! Each contract takes a `base` that namespaces ids and tenants so the same
//! function can run against a shared database more than once.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use serde_json::json;

use cfgplane_store::*;

pub fn lock_row(id: u32, key: &LockKey) -> ResourceLockRow {
    ResourceLockRow {
        id,
        key: key.clone(),
        res_count: 1,
    }
}

pub fn event(id: u32, biz_id: u32) -> EventRow {
    EventRow {
        id,
        biz_id,
        app_id: 7,
        resource: EventResource::Publish,
        resource_id: id * 10,
        resource_uid: String::new(),
        op_type: OpType::Insert,
        final_status: FinalStatus::Unknown,
        creator: "alice".to_string(),
        created_at: Utc::now(),
    }
}

pub fn strategy(id: u32, biz_id: u32) -> StrategyRow {
    let now = Utc::now();
    StrategyRow {
        id,
        biz_id,
        app_id: 7,
        strategy_set_id: 3,
        spec: StrategySpec {
            name: format!("s-{}", id),
            release_id: 11,
            as_default: false,
            namespace: "ns".to_string(),
            scope: json!({"selector": {"region": "eu"}}),
            memo: String::new(),
        },
        pub_state: PubState::None,
        creator: "alice".to_string(),
        reviser: "alice".to_string(),
        created_at: now,
        updated_at: now,
    }
}

pub fn cps(id: u32, strategy: &StrategyRow, revision: u32) -> CurrentPublishedStrategyRow {
    let now = Utc::now();
    CurrentPublishedStrategyRow {
        id,
        biz_id: strategy.biz_id,
        app_id: strategy.app_id,
        strategy_id: strategy.id,
        spec: strategy.spec.clone(),
        revision,
        creator: "alice".to_string(),
        created_at: now,
        updated_at: now,
    }
}

pub async fn uncommitted_writes_are_invisible(shard: &dyn Shard, base: u32) {
    let key = LockKey::new(base, "strategies", "set-1");

    let mut writer = shard.begin().await.unwrap();
    writer.insert_lock(&lock_row(base, &key)).await.unwrap();

    let mut reader = shard.begin().await.unwrap();
    assert_eq!(reader.increment_lock(&key).await.unwrap(), 0);
    reader.rollback().await.unwrap();

    writer.commit().await.unwrap();

    let mut reader = shard.begin().await.unwrap();
    assert_eq!(reader.lock_count_for_update(&key).await.unwrap(), Some(1));
    reader.commit().await.unwrap();
}

pub async fn duplicate_lock_insert_is_reported(shard: &dyn Shard, base: u32) {
    let key = LockKey::new(base, "namespace", "set-1/ns");

    let mut txn = shard.begin().await.unwrap();
    txn.insert_lock(&lock_row(base, &key)).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = shard.begin().await.unwrap();
    let err = txn.insert_lock(&lock_row(base + 1, &key)).await.unwrap_err();
    assert!(err.is_duplicate_key(), "got {err:?}");
}

pub async fn decrement_never_drops_below_one(shard: &dyn Shard, base: u32) {
    let key = LockKey::new(base, "strategies", "set-2");

    let mut txn = shard.begin().await.unwrap();
    txn.insert_lock(&lock_row(base, &key)).await.unwrap();
    assert_eq!(txn.increment_lock(&key).await.unwrap(), 1);
    assert_eq!(txn.lock_count_for_update(&key).await.unwrap(), Some(2));

    assert_eq!(txn.decrement_lock(&key).await.unwrap(), 1);
    assert_eq!(txn.decrement_lock(&key).await.unwrap(), 0);
    assert_eq!(txn.lock_count_for_update(&key).await.unwrap(), Some(1));

    assert_eq!(txn.delete_lock(&key).await.unwrap(), 1);
    assert_eq!(txn.lock_count_for_update(&key).await.unwrap(), None);
    txn.commit().await.unwrap();
}

pub async fn events_list_in_id_order(shard: &dyn Shard, base: u32) {
    let mut txn = shard.begin().await.unwrap();
    txn.insert_events(&[event(base + 3, base), event(base + 1, base), event(base + 2, base)])
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let mut txn = shard.begin().await.unwrap();
    let filter = EventFilter {
        after: Some(base + 1),
        biz_id: Some(base),
        ..Default::default()
    };
    let rows = txn.list_events(&filter, Page::default()).await.unwrap();
    let ids: Vec<u32> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![base + 2, base + 3]);

    assert_eq!(
        txn.set_event_status(&[base + 2], FinalStatus::Success)
            .await
            .unwrap(),
        1
    );
    // A settled event is never settled again.
    assert_eq!(
        txn.set_event_status(&[base + 2, base + 3], FinalStatus::Failed)
            .await
            .unwrap(),
        1
    );
    let row = txn.get_event(base + 2).await.unwrap().unwrap();
    assert_eq!(row.final_status, FinalStatus::Success);
    let row = txn.get_event(base + 3).await.unwrap().unwrap();
    assert_eq!(row.final_status, FinalStatus::Failed);
    txn.commit().await.unwrap();
}

pub async fn stale_unknown_events_fail(shard: &dyn Shard, base: u32) {
    let mut old = event(base, base);
    old.created_at = Utc::now() - Duration::hours(2);
    let fresh = event(base + 1, base);

    let mut txn = shard.begin().await.unwrap();
    txn.insert_events(&[old, fresh]).await.unwrap();
    let swept = txn
        .fail_stale_events(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert!(swept >= 1);
    assert_eq!(
        txn.get_event(base).await.unwrap().unwrap().final_status,
        FinalStatus::Failed
    );
    assert_eq!(
        txn.get_event(base + 1).await.unwrap().unwrap().final_status,
        FinalStatus::Unknown
    );
    txn.commit().await.unwrap();
}

pub async fn pub_state_transition_is_guarded(shard: &dyn Shard, base: u32) {
    let row = strategy(base, base);
    let target = row.reference();

    let mut txn = shard.begin().await.unwrap();
    txn.insert_strategy(&row).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = shard.begin().await.unwrap();
    let guard = PubStateGuard::IsNot(PubState::Publishing);
    assert_eq!(
        txn.transition_pub_state(&target, guard, PubState::Publishing, "bob")
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        txn.transition_pub_state(&target, guard, PubState::Publishing, "bob")
            .await
            .unwrap(),
        0
    );
    let stored = txn.get_strategy(base, base).await.unwrap().unwrap();
    assert_eq!(stored.pub_state, PubState::Publishing);
    assert_eq!(stored.reviser, "bob");
    txn.commit().await.unwrap();
}

pub async fn current_published_is_unique_per_strategy(shard: &dyn Shard, base: u32) {
    let row = strategy(base, base);

    let mut txn = shard.begin().await.unwrap();
    txn.insert_current_published(&cps(base, &row, 1)).await.unwrap();
    txn.commit().await.unwrap();

    let mut txn = shard.begin().await.unwrap();
    let err = txn
        .insert_current_published(&cps(base + 1, &row, 1))
        .await
        .unwrap_err();
    assert!(err.is_duplicate_key(), "got {err:?}");
    drop(txn);

    let mut txn = shard.begin().await.unwrap();
    let mut current = txn
        .get_current_published(base, base)
        .await
        .unwrap()
        .unwrap();
    current.revision = 2;
    assert_eq!(txn.update_current_published(&current).await.unwrap(), 1);
    assert_eq!(txn.current_published_ids(base, 7).await.unwrap(), vec![base]);
    assert_eq!(txn.count_current_published(base, 7).await.unwrap(), 1);
    txn.commit().await.unwrap();

    let mut txn = shard.begin().await.unwrap();
    let listed = txn
        .list_current_published(base, 7, Page::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].revision, 2);
    assert_eq!(listed[0].spec, row.spec);
}
