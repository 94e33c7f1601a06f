//! Shared fixtures: a control plane over in-memory shards.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cfgplane_core::{ControlPlane, RetryPolicy};
use cfgplane_store::*;
use chrono::Utc;
use serde_json::json;

pub const BIZ: u32 = 1;
pub const APP: u32 = 2;
pub const SET: u32 = 3;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        backoff: Duration::from_millis(1),
    }
}

/// One shard holding everything.
pub fn single_shard() -> (Arc<MemoryShard>, ControlPlane) {
    let shard = Arc::new(MemoryShard::new(0));
    let resolver = StaticShardResolver::single(shard.clone());
    let plane = ControlPlane::new(Arc::new(resolver)).with_retry(fast_retry());
    (shard, plane)
}

pub fn spec(name: &str) -> StrategySpec {
    StrategySpec {
        name: name.to_string(),
        release_id: 11,
        as_default: false,
        namespace: String::new(),
        scope: json!({"selector": {"region": "eu"}}),
        memo: String::new(),
    }
}

/// Insert a strategy row with a fixed id, bypassing the lock slots.
pub async fn seed_strategy(shard: &dyn Shard, id: u32) -> StrategyRow {
    let now = Utc::now();
    let row = StrategyRow {
        id,
        biz_id: BIZ,
        app_id: APP,
        strategy_set_id: SET,
        spec: spec(&format!("strategy-{}", id)),
        pub_state: PubState::None,
        creator: "seed".to_string(),
        reviser: "seed".to_string(),
        created_at: now,
        updated_at: now,
    };
    let mut txn = shard.begin().await.unwrap();
    txn.insert_strategy(&row).await.unwrap();
    txn.commit().await.unwrap();
    row
}

pub async fn all_events(shard: &dyn Shard) -> Vec<EventRow> {
    let mut txn = shard.begin().await.unwrap();
    txn.list_events(&EventFilter::default(), Page::new(0, Page::MAX_LIMIT))
        .await
        .unwrap()
}

pub async fn lock_count(shard: &dyn Shard, key: &LockKey) -> Option<u32> {
    let mut txn = shard.begin().await.unwrap();
    txn.lock_count_for_update(key).await.unwrap()
}
