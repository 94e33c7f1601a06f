//! Resource lock behaviour across concurrent transactions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cfgplane_core::{lock_key, CreateStrategyOption, Error, Kit};
use cfgplane_store::Shard;
use common::*;

#[tokio::test]
async fn racing_first_increase_asks_for_a_retry() {
    let (shard, plane) = single_shard();
    let key = lock_key::strategies(BIZ, SET);

    let kit_a = Kit::new("alice");
    let mut txn_a = shard.begin().await.unwrap();
    assert_eq!(
        plane
            .locks
            .increase_count(&kit_a, txn_a.as_mut(), &key)
            .await
            .unwrap(),
        0
    );

    // B misses the uncommitted row, then blocks on A's insert.
    let locks = plane.locks.clone();
    let racing_key = key.clone();
    let mut txn_b = shard.begin().await.unwrap();
    let racer = tokio::spawn(async move {
        let kit_b = Kit::new("bob");
        locks.increase_count(&kit_b, txn_b.as_mut(), &racing_key).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    txn_a.commit().await.unwrap();

    let err = racer.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::RetryTransaction));
    assert_eq!(lock_count(shard.as_ref(), &key).await, Some(1));
}

#[tokio::test]
async fn racing_unique_claims_have_one_winner() {
    let (shard, plane) = single_shard();
    let key = lock_key::app_name(BIZ, "web");

    let kit = Kit::new("alice");
    let mut txn_a = shard.begin().await.unwrap();
    assert!(plane
        .locks
        .add_unique(&kit, txn_a.as_mut(), &key)
        .await
        .unwrap());

    let locks = plane.locks.clone();
    let racing_key = key.clone();
    let mut txn_b = shard.begin().await.unwrap();
    let racer = tokio::spawn(async move {
        locks
            .add_unique(&Kit::new("bob"), txn_b.as_mut(), &racing_key)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    txn_a.commit().await.unwrap();

    assert!(!racer.await.unwrap().unwrap());
}

#[tokio::test]
async fn loser_of_a_rolled_back_claim_takes_the_slot() {
    let (shard, plane) = single_shard();
    let key = lock_key::app_name(BIZ, "api");

    let mut txn_a = shard.begin().await.unwrap();
    assert!(plane
        .locks
        .add_unique(&Kit::new("alice"), txn_a.as_mut(), &key)
        .await
        .unwrap());

    let locks = plane.locks.clone();
    let racing_key = key.clone();
    let mut txn_b = shard.begin().await.unwrap();
    let racer = tokio::spawn(async move {
        let claimed = locks
            .add_unique(&Kit::new("bob"), txn_b.as_mut(), &racing_key)
            .await;
        txn_b.commit().await.unwrap();
        claimed
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    txn_a.rollback().await.unwrap();

    assert!(racer.await.unwrap().unwrap());
    assert_eq!(lock_count(shard.as_ref(), &key).await, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_in_a_fresh_set_all_succeed() {
    let (shard, plane) = single_shard();

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let strategies = plane.strategies.clone();
            tokio::spawn(async move {
                let opt = CreateStrategyOption {
                    biz_id: BIZ,
                    app_id: APP,
                    strategy_set_id: SET,
                    spec: spec(&format!("s-{}", i)),
                };
                strategies.create(&Kit::new("alice"), &opt).await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }
    assert_eq!(
        lock_count(shard.as_ref(), &lock_key::strategies(BIZ, SET)).await,
        Some(4)
    );
}

#[tokio::test]
async fn held_row_times_out() {
    let shard = Arc::new(
        cfgplane_store::MemoryShard::new(0).with_lock_wait(Duration::from_millis(20)),
    );
    let resolver = cfgplane_store::StaticShardResolver::single(shard.clone());
    let plane = cfgplane_core::ControlPlane::new(Arc::new(resolver));
    let key = lock_key::config_items(BIZ, APP);
    let kit = Kit::new("alice");

    let mut holder = shard.begin().await.unwrap();
    plane
        .locks
        .increase_count(&kit, holder.as_mut(), &key)
        .await
        .unwrap();
    holder.commit().await.unwrap();

    let mut holder = shard.begin().await.unwrap();
    plane
        .locks
        .increase_count(&kit, holder.as_mut(), &key)
        .await
        .unwrap();

    let mut waiter = shard.begin().await.unwrap();
    let err = plane
        .locks
        .decrease_count(&kit, waiter.as_mut(), &key)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DbOpFailed { .. }), "{err:?}");
}
