//! Strategy publishing.
//!
//! Publishing moves a strategy through `None | Published -> Publishing ->
//! Published`. The first step snapshots the strategy into its
//! current-published projection (one row per strategy, updated in place),
//! appends a history row, writes an audit and fires a `Publish` event, all in
//! one transaction on the tenant's shard. A strategy that is already
//! `Publishing` rejects a second publish until `finish_publish` runs.

use std::sync::Arc;

use async_trait::async_trait;
use cfgplane_store::{
    CurrentPublishedStrategyRow, EventResource, IdKind, OpType, Page, PubState, PubStateGuard,
    PublishedStrategyHistoryRow, ShardResolver, StrategyRef, Txn,
};
use chrono::Utc;
use tracing::instrument;

use crate::audit::{AuditAction, AuditBuilder, AuditResource, FieldChanges};
use crate::error::{Error, Result};
use crate::event::{EventOutbox, EventSpec, FiredEvents};
use crate::id::IdGenerator;
use crate::kit::Kit;
use crate::obs;
use crate::txn::{run_in_txn, RetryPolicy, TxnJob};

/// Which strategy to publish or finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOption {
    pub biz_id: u32,
    pub app_id: u32,
    pub strategy_id: u32,
}

impl PublishOption {
    pub fn validate(&self) -> Result<()> {
        if self.biz_id == 0 || self.app_id == 0 || self.strategy_id == 0 {
            return Err(Error::InvalidParameter(
                "biz_id, app_id and strategy_id are required".to_string(),
            ));
        }
        Ok(())
    }

    fn target(&self) -> StrategyRef {
        StrategyRef {
            biz_id: self.biz_id,
            app_id: self.app_id,
            id: self.strategy_id,
        }
    }
}

#[derive(Clone)]
pub struct PublishController {
    resolver: Arc<dyn ShardResolver>,
    ids: IdGenerator,
    outbox: EventOutbox,
    retry: RetryPolicy,
}

impl PublishController {
    pub fn new(resolver: Arc<dyn ShardResolver>, ids: IdGenerator, outbox: EventOutbox) -> Self {
        Self {
            resolver,
            ids,
            outbox,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish a strategy. Returns the id of the new history row.
    #[instrument(skip(self, kit), fields(rid = %kit.rid))]
    pub async fn publish_strategy(&self, kit: &Kit, opt: &PublishOption) -> Result<u32> {
        opt.validate()?;
        let shard = self.resolver.sharding_one(opt.biz_id);
        let mut job = PublishJob {
            ctl: self,
            opt,
            fired: None,
            revision: 0,
        };

        let outcome = run_in_txn(shard.as_ref(), kit, &self.retry, &mut job).await;
        if let Some(fired) = &job.fired {
            self.outbox.finalize(kit, fired, &outcome).await;
        }
        if let Ok(history_id) = &outcome {
            obs::emit_strategy_published(&kit.rid, opt.strategy_id, job.revision, *history_id);
        }
        outcome
    }

    /// Complete a publish: `Publishing -> Published`.
    #[instrument(skip(self, kit), fields(rid = %kit.rid))]
    pub async fn finish_publish(&self, kit: &Kit, opt: &PublishOption) -> Result<()> {
        opt.validate()?;
        let shard = self.resolver.sharding_one(opt.biz_id);
        let mut job = FinishJob { ctl: self, opt };
        run_in_txn(shard.as_ref(), kit, &self.retry, &mut job).await?;
        obs::emit_publish_finished(&kit.rid, opt.strategy_id);
        Ok(())
    }

    /// Current-published strategies of an app and their total count.
    pub async fn get_app_cp_strategies(
        &self,
        kit: &Kit,
        biz_id: u32,
        app_id: u32,
        page: Page,
    ) -> Result<(Vec<CurrentPublishedStrategyRow>, u64)> {
        if !page.is_valid() {
            return Err(Error::InvalidParameter(format!(
                "page limit must be within 1..={}",
                Page::MAX_LIMIT
            )));
        }
        let shard = self.resolver.sharding_one(biz_id);
        let mut txn = kit.exec(shard.begin()).await?;
        let rows = kit
            .exec(txn.list_current_published(biz_id, app_id, page))
            .await?;
        let count = kit
            .exec(txn.count_current_published(biz_id, app_id))
            .await?;
        kit.exec(txn.commit()).await?;
        Ok((rows, count))
    }

    /// Ids of every current-published strategy of an app.
    pub async fn get_app_cps_ids(&self, kit: &Kit, biz_id: u32, app_id: u32) -> Result<Vec<u32>> {
        let shard = self.resolver.sharding_one(biz_id);
        let mut txn = kit.exec(shard.begin()).await?;
        let ids = kit
            .exec(txn.current_published_ids(biz_id, app_id))
            .await?;
        kit.exec(txn.commit()).await?;
        Ok(ids)
    }

    /// Publish history of a strategy, oldest first.
    pub async fn list_history(
        &self,
        kit: &Kit,
        biz_id: u32,
        strategy_id: u32,
    ) -> Result<Vec<PublishedStrategyHistoryRow>> {
        let shard = self.resolver.sharding_one(biz_id);
        let mut txn = kit.exec(shard.begin()).await?;
        let rows = kit.exec(txn.list_history(biz_id, strategy_id)).await?;
        kit.exec(txn.commit()).await?;
        Ok(rows)
    }

    /// Tell a missing strategy apart from one in the wrong state after a
    /// guarded transition matched no row.
    async fn explain_rejected(
        &self,
        kit: &Kit,
        txn: &mut dyn Txn,
        opt: &PublishOption,
        rejected: &str,
    ) -> Error {
        match kit.exec(txn.get_strategy(opt.biz_id, opt.strategy_id)).await {
            Ok(Some(row)) if row.app_id == opt.app_id => Error::Aborted(format!(
                "strategy {} is {}, {}",
                opt.strategy_id,
                row.pub_state.as_str(),
                rejected
            )),
            Ok(_) => Error::RecordNotFound(format!(
                "strategy {} of app {}",
                opt.strategy_id, opt.app_id
            )),
            Err(e) => e,
        }
    }
}

struct PublishJob<'a> {
    ctl: &'a PublishController,
    opt: &'a PublishOption,
    fired: Option<FiredEvents>,
    revision: u32,
}

#[async_trait]
impl TxnJob for PublishJob<'_> {
    type Output = u32;

    async fn run(&mut self, kit: &Kit, txn: &mut dyn Txn) -> Result<u32> {
        let ctl = self.ctl;
        let opt = self.opt;
        let target = opt.target();
        self.fired = None;

        let before = kit
            .exec(txn.get_strategy(opt.biz_id, opt.strategy_id))
            .await?
            .filter(|row| row.app_id == opt.app_id)
            .ok_or_else(|| {
                Error::RecordNotFound(format!(
                    "strategy {} of app {}",
                    opt.strategy_id, opt.app_id
                ))
            })?;

        let guard = PubStateGuard::IsNot(PubState::Publishing);
        let moved = kit
            .exec(txn.transition_pub_state(&target, guard, PubState::Publishing, &kit.user))
            .await?;
        if moved == 0 {
            return Err(ctl
                .explain_rejected(kit, txn, opt, "finish the last publish first")
                .await);
        }
        // Re-read under the row lock the transition took.
        let strategy = kit
            .exec(txn.get_strategy(opt.biz_id, opt.strategy_id))
            .await?
            .ok_or_else(|| Error::db(kit, format!("strategy {} vanished", opt.strategy_id)))?;

        let now = Utc::now();
        let current = kit
            .exec(txn.get_current_published(opt.biz_id, opt.strategy_id))
            .await?;
        let (revision, prior_revision) = match current {
            Some(mut row) => {
                let prior = row.revision;
                row.revision += 1;
                row.spec = strategy.spec.clone();
                row.updated_at = now;
                let updated = kit.exec(txn.update_current_published(&row)).await?;
                if updated != 1 {
                    return Err(Error::db(
                        kit,
                        format!("current publish of strategy {} not updated", opt.strategy_id),
                    ));
                }
                (row.revision, prior)
            }
            None => {
                let row = CurrentPublishedStrategyRow {
                    id: ctl.ids.one(kit, IdKind::CurrentPublishedStrategies).await?,
                    biz_id: opt.biz_id,
                    app_id: opt.app_id,
                    strategy_id: opt.strategy_id,
                    spec: strategy.spec.clone(),
                    revision: 1,
                    creator: kit.user.clone(),
                    created_at: now,
                    updated_at: now,
                };
                match kit.within(txn.insert_current_published(&row)).await? {
                    Ok(()) => {}
                    // Someone else created the projection first.
                    Err(e) if e.is_duplicate_key() => return Err(Error::RetryTransaction),
                    Err(e) => return Err(Error::db(kit, e)),
                }
                (1, 0)
            }
        };

        let history = PublishedStrategyHistoryRow {
            id: ctl.ids.one(kit, IdKind::PublishedStrategyHistories).await?,
            biz_id: opt.biz_id,
            app_id: opt.app_id,
            strategy_id: opt.strategy_id,
            spec: strategy.spec.clone(),
            revision,
            creator: kit.user.clone(),
            created_at: now,
        };
        kit.exec(txn.insert_history(&history)).await?;

        let changes = FieldChanges::new()
            .record("pub_state", before.pub_state, PubState::Publishing)?
            .record("revision", prior_revision, revision)?;
        AuditBuilder::new(AuditResource::Strategy, AuditAction::Publish)
            .tenant(opt.biz_id, opt.app_id)
            .resource_id(opt.strategy_id)
            .changes(changes)
            .write(kit, txn, &ctl.ids)
            .await?;

        let event = EventSpec::new(
            opt.biz_id,
            opt.app_id,
            EventResource::Publish,
            opt.strategy_id,
            OpType::Insert,
        );
        self.fired = Some(ctl.outbox.fire(kit, txn, &[event]).await?);
        self.revision = revision;
        Ok(history.id)
    }
}

struct FinishJob<'a> {
    ctl: &'a PublishController,
    opt: &'a PublishOption,
}

#[async_trait]
impl TxnJob for FinishJob<'_> {
    type Output = ();

    async fn run(&mut self, kit: &Kit, txn: &mut dyn Txn) -> Result<()> {
        let guard = PubStateGuard::Is(PubState::Publishing);
        let target = self.opt.target();
        let moved = kit
            .exec(txn.transition_pub_state(&target, guard, PubState::Published, &kit.user))
            .await?;
        if moved == 0 {
            return Err(self
                .ctl
                .explain_rejected(kit, txn, self.opt, "nothing to finish")
                .await);
        }

        let changes =
            FieldChanges::new().record("pub_state", PubState::Publishing, PubState::Published)?;
        AuditBuilder::new(AuditResource::Strategy, AuditAction::FinishPublish)
            .tenant(self.opt.biz_id, self.opt.app_id)
            .resource_id(self.opt.strategy_id)
            .changes(changes)
            .write(kit, txn, &self.ctl.ids)
            .await?;
        Ok(())
    }
}
