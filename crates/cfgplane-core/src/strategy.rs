//! Strategy create/delete composed from the consistency primitives.
//!
//! A strategy occupies three lock slots in its tenant:
//! - the strategy count of its set, capped by `StrategyLimits::max_per_set`;
//! - the default slot of its set, when it is the default strategy;
//! - the namespace slot of its set, when it names a namespace.
//!
//! Create takes the slots before inserting the row; delete releases them in
//! the same transaction that removes the row.

use std::sync::Arc;

use async_trait::async_trait;
use cfgplane_store::{
    EventResource, IdKind, OpType, PubState, ShardResolver, StrategyRow, StrategySpec, Txn,
};
use chrono::Utc;
use tracing::instrument;

use crate::audit::{AuditAction, AuditBuilder, AuditResource, FieldChanges};
use crate::error::{Error, Result};
use crate::event::{EventOutbox, EventSpec, FiredEvents};
use crate::id::IdGenerator;
use crate::kit::Kit;
use crate::lock::{lock_key, ResourceLock};
use crate::obs;
use crate::txn::{run_in_txn, RetryPolicy, TxnJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyLimits {
    pub max_per_set: u32,
}

impl Default for StrategyLimits {
    fn default() -> Self {
        Self { max_per_set: 5 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateStrategyOption {
    pub biz_id: u32,
    pub app_id: u32,
    pub strategy_set_id: u32,
    pub spec: StrategySpec,
}

impl CreateStrategyOption {
    pub fn validate(&self) -> Result<()> {
        if self.biz_id == 0 || self.app_id == 0 || self.strategy_set_id == 0 {
            return Err(Error::InvalidParameter(
                "biz_id, app_id and strategy_set_id are required".to_string(),
            ));
        }
        if self.spec.name.trim().is_empty() {
            return Err(Error::InvalidParameter("strategy name is required".to_string()));
        }
        if self.spec.release_id == 0 {
            return Err(Error::InvalidParameter("strategy release_id is required".to_string()));
        }
        if self.spec.as_default && !self.spec.namespace.is_empty() {
            return Err(Error::InvalidParameter(
                "a default strategy cannot bind a namespace".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct StrategyStore {
    resolver: Arc<dyn ShardResolver>,
    ids: IdGenerator,
    locks: ResourceLock,
    outbox: EventOutbox,
    limits: StrategyLimits,
    retry: RetryPolicy,
}

impl StrategyStore {
    pub fn new(
        resolver: Arc<dyn ShardResolver>,
        ids: IdGenerator,
        locks: ResourceLock,
        outbox: EventOutbox,
    ) -> Self {
        Self {
            resolver,
            ids,
            locks,
            outbox,
            limits: StrategyLimits::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_limits(mut self, limits: StrategyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create a strategy in state `None`. Returns its id.
    #[instrument(skip(self, kit, opt), fields(rid = %kit.rid, biz_id = opt.biz_id))]
    pub async fn create(&self, kit: &Kit, opt: &CreateStrategyOption) -> Result<u32> {
        opt.validate()?;
        let shard = self.resolver.sharding_one(opt.biz_id);
        let mut job = CreateJob { store: self, opt };
        let id = run_in_txn(shard.as_ref(), kit, &self.retry, &mut job).await?;
        obs::emit_strategy_created(&kit.rid, opt.biz_id, id);
        Ok(id)
    }

    /// Delete a strategy and release its slots.
    ///
    /// A strategy that was ever published also loses its current-published
    /// projection, and a `Strategy/Delete` event tells consumers to drop it.
    #[instrument(skip(self, kit), fields(rid = %kit.rid))]
    pub async fn delete(
        &self,
        kit: &Kit,
        biz_id: u32,
        app_id: u32,
        strategy_id: u32,
    ) -> Result<()> {
        let shard = self.resolver.sharding_one(biz_id);
        let mut job = DeleteJob {
            store: self,
            biz_id,
            app_id,
            strategy_id,
            fired: None,
        };

        let outcome = run_in_txn(shard.as_ref(), kit, &self.retry, &mut job).await;
        if let Some(fired) = &job.fired {
            self.outbox.finalize(kit, fired, &outcome).await;
        }
        let was_published = outcome?;
        obs::emit_strategy_deleted(&kit.rid, biz_id, strategy_id, was_published);
        Ok(())
    }

    pub async fn get(&self, kit: &Kit, biz_id: u32, strategy_id: u32) -> Result<StrategyRow> {
        let shard = self.resolver.sharding_one(biz_id);
        let mut txn = kit.exec(shard.begin()).await?;
        let row = kit.exec(txn.get_strategy(biz_id, strategy_id)).await?;
        kit.exec(txn.commit()).await?;
        row.ok_or_else(|| Error::RecordNotFound(format!("strategy {}", strategy_id)))
    }
}

struct CreateJob<'a> {
    store: &'a StrategyStore,
    opt: &'a CreateStrategyOption,
}

#[async_trait]
impl TxnJob for CreateJob<'_> {
    type Output = u32;

    async fn run(&mut self, kit: &Kit, txn: &mut dyn Txn) -> Result<u32> {
        let store = self.store;
        let opt = self.opt;
        let (biz_id, set_id) = (opt.biz_id, opt.strategy_set_id);

        store
            .locks
            .increase_count_within(
                kit,
                txn,
                &lock_key::strategies(biz_id, set_id),
                store.limits.max_per_set,
            )
            .await?;

        if opt.spec.as_default
            && !store
                .locks
                .add_unique(kit, txn, &lock_key::default_strategy(biz_id, set_id))
                .await?
        {
            return Err(Error::Aborted(format!(
                "strategy set {} already has a default strategy",
                set_id
            )));
        }

        if !opt.spec.namespace.is_empty()
            && !store
                .locks
                .add_unique(kit, txn, &lock_key::namespace(biz_id, set_id, &opt.spec.namespace))
                .await?
        {
            return Err(Error::Aborted(format!(
                "namespace {} is already used in strategy set {}",
                opt.spec.namespace, set_id
            )));
        }

        let now = Utc::now();
        let row = StrategyRow {
            id: store.ids.one(kit, IdKind::Strategies).await?,
            biz_id,
            app_id: opt.app_id,
            strategy_set_id: set_id,
            spec: opt.spec.clone(),
            pub_state: PubState::None,
            creator: kit.user.clone(),
            reviser: kit.user.clone(),
            created_at: now,
            updated_at: now,
        };
        kit.exec(txn.insert_strategy(&row)).await?;

        let changes = FieldChanges::new()
            .record("name", Option::<&str>::None, &row.spec.name)?
            .record("release_id", Option::<u32>::None, row.spec.release_id)?
            .record("namespace", Option::<&str>::None, &row.spec.namespace)?;
        AuditBuilder::new(AuditResource::Strategy, AuditAction::Create)
            .tenant(biz_id, opt.app_id)
            .resource_id(row.id)
            .changes(changes)
            .write(kit, txn, &store.ids)
            .await?;
        Ok(row.id)
    }
}

struct DeleteJob<'a> {
    store: &'a StrategyStore,
    biz_id: u32,
    app_id: u32,
    strategy_id: u32,
    fired: Option<FiredEvents>,
}

#[async_trait]
impl TxnJob for DeleteJob<'_> {
    /// Whether the strategy had been published.
    type Output = bool;

    async fn run(&mut self, kit: &Kit, txn: &mut dyn Txn) -> Result<bool> {
        let store = self.store;
        self.fired = None;

        // Lock first: a concurrent publish may still move the row.
        let row = kit
            .exec(txn.get_strategy_for_update(self.biz_id, self.strategy_id))
            .await?
            .filter(|row| row.app_id == self.app_id)
            .ok_or_else(|| {
                Error::RecordNotFound(format!(
                    "strategy {} of app {}",
                    self.strategy_id, self.app_id
                ))
            })?;
        let (biz_id, set_id) = (row.biz_id, row.strategy_set_id);

        store
            .locks
            .decrease_count(kit, txn, &lock_key::strategies(biz_id, set_id))
            .await?;
        if row.spec.as_default {
            store
                .locks
                .delete_unique(kit, txn, &lock_key::default_strategy(biz_id, set_id))
                .await?;
        }
        if !row.spec.namespace.is_empty() {
            store
                .locks
                .delete_unique(kit, txn, &lock_key::namespace(biz_id, set_id, &row.spec.namespace))
                .await?;
        }

        let deleted = kit.exec(txn.delete_strategy(biz_id, row.id)).await?;
        if deleted != 1 {
            return Err(Error::db(
                kit,
                format!("delete of strategy {} touched {} rows", row.id, deleted),
            ));
        }

        let was_published = row.pub_state != PubState::None;
        if was_published {
            kit.exec(txn.delete_current_published(biz_id, row.id))
                .await?;
        }

        let changes = FieldChanges::new()
            .record("name", &row.spec.name, Option::<&str>::None)?
            .record("pub_state", row.pub_state, Option::<PubState>::None)?;
        AuditBuilder::new(AuditResource::Strategy, AuditAction::Delete)
            .tenant(biz_id, row.app_id)
            .resource_id(row.id)
            .changes(changes)
            .write(kit, txn, &store.ids)
            .await?;

        if was_published {
            let event = EventSpec::new(
                biz_id,
                row.app_id,
                EventResource::Strategy,
                row.id,
                OpType::Delete,
            );
            self.fired = Some(store.outbox.fire(kit, txn, &[event]).await?);
        }
        Ok(was_published)
    }
}
