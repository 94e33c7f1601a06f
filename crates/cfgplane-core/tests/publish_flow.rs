//! Strategy publish state machine end to end.

mod common;

use cfgplane_core::{Error, Kit, PublishOption};
use cfgplane_store::{EventResource, FinalStatus, OpType, Page, PubState, Shard};
use common::*;

fn opt(strategy_id: u32) -> PublishOption {
    PublishOption {
        biz_id: BIZ,
        app_id: APP,
        strategy_id,
    }
}

#[tokio::test]
async fn publish_then_finish() {
    let (shard, plane) = single_shard();
    let seeded = seed_strategy(shard.as_ref(), 7).await;
    let kit = Kit::new("alice");

    let history_id = plane.publish.publish_strategy(&kit, &opt(7)).await.unwrap();

    let strategy = plane.strategies.get(&kit, BIZ, 7).await.unwrap();
    assert_eq!(strategy.pub_state, PubState::Publishing);
    assert_eq!(strategy.reviser, "alice");

    let history = plane.publish.list_history(&kit, BIZ, 7).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, history_id);
    assert_eq!(history[0].revision, 1);
    assert_eq!(history[0].spec, seeded.spec);

    let (current, count) = plane
        .publish
        .get_app_cp_strategies(&kit, BIZ, APP, Page::default())
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(current[0].strategy_id, 7);
    assert_eq!(current[0].revision, 1);
    assert_eq!(
        plane.publish.get_app_cps_ids(&kit, BIZ, APP).await.unwrap(),
        vec![current[0].id]
    );

    let events = all_events(shard.as_ref()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].resource, EventResource::Publish);
    assert_eq!(events[0].op_type, OpType::Insert);
    assert_eq!(events[0].resource_id, 7);
    assert_eq!(events[0].final_status, FinalStatus::Success);

    let err = plane
        .publish
        .publish_strategy(&kit, &opt(7))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(ref msg) if msg.contains("finish the last publish")));
    // The rejected publish left nothing behind.
    assert_eq!(plane.publish.list_history(&kit, BIZ, 7).await.unwrap().len(), 1);
    assert_eq!(all_events(shard.as_ref()).await.len(), 1);

    plane.publish.finish_publish(&kit, &opt(7)).await.unwrap();
    let strategy = plane.strategies.get(&kit, BIZ, 7).await.unwrap();
    assert_eq!(strategy.pub_state, PubState::Published);
    // Finishing fires nothing.
    assert_eq!(all_events(shard.as_ref()).await.len(), 1);

    let mut txn = shard.begin().await.unwrap();
    let audits = txn.list_audits(BIZ, "strategy", 7).await.unwrap();
    let actions: Vec<&str> = audits.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["publish", "finish_publish"]);
}

#[tokio::test]
async fn republish_bumps_the_revision_in_place() {
    let (shard, plane) = single_shard();
    seed_strategy(shard.as_ref(), 7).await;
    let kit = Kit::new("alice");

    plane.publish.publish_strategy(&kit, &opt(7)).await.unwrap();
    plane.publish.finish_publish(&kit, &opt(7)).await.unwrap();
    plane.publish.publish_strategy(&kit, &opt(7)).await.unwrap();

    let (current, count) = plane
        .publish
        .get_app_cp_strategies(&kit, BIZ, APP, Page::default())
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(current[0].revision, 2);

    let revisions: Vec<u32> = plane
        .publish
        .list_history(&kit, BIZ, 7)
        .await
        .unwrap()
        .iter()
        .map(|h| h.revision)
        .collect();
    assert_eq!(revisions, vec![1, 2]);
    assert_eq!(all_events(shard.as_ref()).await.len(), 2);
}

#[tokio::test]
async fn missing_strategy_is_not_found() {
    let (shard, plane) = single_shard();
    seed_strategy(shard.as_ref(), 7).await;
    let kit = Kit::new("alice");

    let err = plane
        .publish
        .publish_strategy(&kit, &opt(8))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));

    // Right id, wrong app.
    let wrong_app = PublishOption {
        app_id: APP + 1,
        ..opt(7)
    };
    let err = plane
        .publish
        .publish_strategy(&kit, &wrong_app)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));
    assert!(all_events(shard.as_ref()).await.is_empty());
}

#[tokio::test]
async fn finish_requires_publishing() {
    let (shard, plane) = single_shard();
    seed_strategy(shard.as_ref(), 7).await;
    let kit = Kit::new("alice");

    let err = plane
        .publish
        .finish_publish(&kit, &opt(7))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    let err = plane
        .publish
        .finish_publish(&kit, &opt(9))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let (_shard, plane) = single_shard();
    let err = plane
        .publish
        .publish_strategy(&Kit::new("alice"), &opt(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    let err = plane
        .publish
        .get_app_cp_strategies(&Kit::new("alice"), BIZ, APP, Page::new(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishes_have_one_winner() {
    let (shard, plane) = single_shard();
    seed_strategy(shard.as_ref(), 7).await;

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let publish = plane.publish.clone();
            tokio::spawn(async move {
                publish
                    .publish_strategy(&Kit::new(format!("op-{}", i)), &opt(7))
                    .await
            })
        })
        .collect();

    let mut won = 0;
    for task in futures::future::join_all(tasks).await {
        match task.unwrap() {
            Ok(_) => won += 1,
            Err(Error::Aborted(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(won, 1);

    let kit = Kit::new("alice");
    assert_eq!(plane.publish.list_history(&kit, BIZ, 7).await.unwrap().len(), 1);
    let events = all_events(shard.as_ref()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].final_status, FinalStatus::Success);
}
