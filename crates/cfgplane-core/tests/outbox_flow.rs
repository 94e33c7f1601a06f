//! Outbox producer and consumer flows.

mod common;

use std::time::Duration;

use cfgplane_core::{Error, EventSpec, Kit, PURGE_BATCH};
use cfgplane_store::{EventResource, FinalStatus, OpType, Page, Shard, CURSOR_REMINDER_ID};
use common::*;

fn events(n: u32) -> Vec<EventSpec> {
    (1..=n)
        .map(|i| EventSpec::new(BIZ, APP, EventResource::ConfigItem, i, OpType::Update))
        .collect()
}

#[tokio::test]
async fn finalize_follows_the_transaction_outcome() {
    let (shard, plane) = single_shard();
    let kit = Kit::new("alice");

    let mut txn = shard.begin().await.unwrap();
    let ok = plane.outbox.fire(&kit, txn.as_mut(), &events(2)).await.unwrap();
    txn.commit().await.unwrap();
    plane.outbox.finalize(&kit, &ok, &Ok::<_, Error>(())).await;

    let mut txn = shard.begin().await.unwrap();
    let failed = plane.outbox.fire(&kit, txn.as_mut(), &events(1)).await.unwrap();
    txn.commit().await.unwrap();
    let outcome: Result<(), Error> = Err(Error::Aborted("downstream".to_string()));
    plane.outbox.finalize(&kit, &failed, &outcome).await;

    let rows = all_events(shard.as_ref()).await;
    let status_of = |id: u32| rows.iter().find(|r| r.id == id).unwrap().final_status;
    for id in ok.ids() {
        assert_eq!(status_of(*id), FinalStatus::Success);
    }
    assert_eq!(status_of(failed.ids()[0]), FinalStatus::Failed);
}

#[tokio::test]
async fn cursor_splits_pending_from_consumed() {
    let (shard, plane) = single_shard();
    let kit = Kit::new("consumer");

    let mut txn = shard.begin().await.unwrap();
    let fired = plane.outbox.fire(&kit, txn.as_mut(), &events(50)).await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(fired.ids().first(), Some(&2));
    assert_eq!(fired.ids().last(), Some(&51));

    plane.outbox.record_cursor(&kit, shard.as_ref(), 42).await.unwrap();
    assert_eq!(plane.outbox.latest_cursor(&kit, shard.as_ref()).await.unwrap(), 42);

    let consumed = plane
        .outbox
        .list_consumed_events(&kit, shard.as_ref(), 42, Page::new(0, 1000))
        .await
        .unwrap();
    assert_eq!(consumed.len(), 41);
    assert!(consumed.iter().all(|e| e.id <= 42 && e.id != CURSOR_REMINDER_ID));

    let pending = plane
        .outbox
        .list(&kit, shard.as_ref(), 42, Page::new(0, 5))
        .await
        .unwrap();
    let ids: Vec<u32> = pending.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![43, 44, 45, 46, 47]);

    let next_page = plane
        .outbox
        .list(&kit, shard.as_ref(), 42, Page::new(5, 5))
        .await
        .unwrap();
    assert_eq!(next_page.first().map(|e| e.id), Some(48));
}

#[tokio::test]
async fn purge_deletes_in_batches_and_keeps_the_cursor() {
    let (shard, plane) = single_shard();
    let outbox = plane.outbox.clone().with_purge_pause(Duration::from_millis(1));
    let kit = Kit::new("janitor");

    let mut txn = shard.begin().await.unwrap();
    outbox.fire(&kit, txn.as_mut(), &events(250)).await.unwrap();
    txn.commit().await.unwrap();
    outbox.record_cursor(&kit, shard.as_ref(), 251).await.unwrap();

    // Nothing is older than a day yet.
    assert_eq!(outbox.purge(&kit, shard.as_ref(), 1).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let deleted = outbox.purge(&kit, shard.as_ref(), 0).await.unwrap();
    assert_eq!(deleted, 250);
    assert!(deleted > u64::from(PURGE_BATCH));
    assert!(all_events(shard.as_ref()).await.is_empty());
    assert_eq!(outbox.latest_cursor(&kit, shard.as_ref()).await.unwrap(), 251);
}

#[tokio::test]
async fn sweep_fails_events_left_unknown() {
    let (shard, plane) = single_shard();
    let kit = Kit::new("alice");

    let mut txn = shard.begin().await.unwrap();
    let orphan = plane.outbox.fire(&kit, txn.as_mut(), &events(3)).await.unwrap();
    txn.commit().await.unwrap();
    // The producer never finalizes.

    assert_eq!(
        plane
            .outbox
            .sweep_unknown(&kit, shard.as_ref(), Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
    let failed = plane
        .outbox
        .sweep_unknown(&kit, shard.as_ref(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(failed, 3);

    let rows = all_events(shard.as_ref()).await;
    assert!(rows
        .iter()
        .filter(|r| orphan.ids().contains(&r.id))
        .all(|r| r.final_status == FinalStatus::Failed));
}

#[tokio::test]
async fn events_live_on_the_firing_shard() {
    use std::sync::Arc;

    use cfgplane_core::ControlPlane;
    use cfgplane_store::{MemoryShard, ShardResolver, StaticShardResolver};

    let admin: Arc<dyn Shard> = Arc::new(MemoryShard::new(0));
    let tenant_a: Arc<dyn Shard> = Arc::new(MemoryShard::new(1));
    let tenant_b: Arc<dyn Shard> = Arc::new(MemoryShard::new(2));
    let resolver =
        StaticShardResolver::new(admin.clone(), vec![tenant_a.clone(), tenant_b.clone()]).unwrap();
    let plane = ControlPlane::new(Arc::new(resolver));
    let kit = Kit::new("alice");

    let shard = plane.resolver.sharding_one(1);
    assert_eq!(shard.id(), 2);
    let mut txn = shard.begin().await.unwrap();
    let fired = plane.outbox.fire(&kit, txn.as_mut(), &events(1)).await.unwrap();
    txn.commit().await.unwrap();
    plane.outbox.finalize(&kit, &fired, &Ok::<_, Error>(())).await;

    assert_eq!(fired.shard_id(), 2);
    assert_eq!(all_events(tenant_b.as_ref()).await.len(), 1);
    assert!(all_events(tenant_a.as_ref()).await.is_empty());
    assert!(all_events(admin.as_ref()).await.is_empty());
    assert_eq!(
        all_events(tenant_b.as_ref()).await[0].final_status,
        FinalStatus::Success
    );
}

#[tokio::test]
async fn late_finalize_keeps_the_swept_status() {
    let (shard, plane) = single_shard();
    let kit = Kit::new("alice");

    let mut txn = shard.begin().await.unwrap();
    let fired = plane.outbox.fire(&kit, txn.as_mut(), &events(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    txn.commit().await.unwrap();

    let swept = plane
        .outbox
        .sweep_unknown(&kit, shard.as_ref(), Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(swept, 2);

    // The producer outlived the stale timeout; its success comes too late.
    plane.outbox.finalize(&kit, &fired, &Ok::<_, Error>(())).await;

    for row in all_events(shard.as_ref()).await {
        assert_eq!(row.final_status, FinalStatus::Failed);
    }
}
