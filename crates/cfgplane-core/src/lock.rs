//! Resource locks: per-tenant counting and uniqueness slots.
//!
//! A slot is a `resource_locks` row keyed by `(biz_id, res_type, res_key)`.
//! Entity operations touch the slot inside their own transaction, before the
//! protected insert, so the row lock serialises concurrent writers:
//! - counting slots cap how many children a parent may hold;
//! - unique slots make a name or role exclusive within a scope.
//!
//! Every method runs in the caller's transaction and never commits.

use cfgplane_store::{IdKind, LockKey, ResourceLockRow, Txn};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::kit::Kit;
use crate::obs;

#[derive(Clone)]
pub struct ResourceLock {
    ids: IdGenerator,
}

impl ResourceLock {
    pub fn new(ids: IdGenerator) -> Self {
        Self { ids }
    }

    /// Add one to the slot and return the count it held before.
    ///
    /// A slot that does not exist yet is created with count 1. When two
    /// transactions create the same slot concurrently, the loser gets
    /// `Error::RetryTransaction` and must re-run its whole transaction.
    #[instrument(skip(self, kit, txn), fields(rid = %kit.rid, key = %key))]
    pub async fn increase_count(&self, kit: &Kit, txn: &mut dyn Txn, key: &LockKey) -> Result<u32> {
        match kit.exec(txn.increment_lock(key)).await? {
            0 => {
                let row = ResourceLockRow {
                    id: self.ids.one(kit, IdKind::ResourceLocks).await?,
                    key: key.clone(),
                    res_count: 1,
                };
                match kit.within(txn.insert_lock(&row)).await? {
                    Ok(()) => Ok(0),
                    Err(e) if e.is_duplicate_key() => {
                        obs::emit_lock_retry(&kit.rid, key);
                        Err(Error::RetryTransaction)
                    }
                    Err(e) => Err(Error::db(kit, e)),
                }
            }
            1 => {
                let count = kit
                    .exec(txn.lock_count_for_update(key))
                    .await?
                    .ok_or_else(|| Error::db(kit, format!("lock {} vanished after update", key)))?;
                Ok(count.saturating_sub(1))
            }
            n => Err(Error::db(
                kit,
                format!("lock {} matched {} rows, expected at most 1", key, n),
            )),
        }
    }

    /// `increase_count`, failing when the slot already holds `limit`.
    ///
    /// The increment is rolled back together with the caller's transaction.
    pub async fn increase_count_within(
        &self,
        kit: &Kit,
        txn: &mut dyn Txn,
        key: &LockKey,
        limit: u32,
    ) -> Result<u32> {
        let prior = self.increase_count(kit, txn, key).await?;
        if prior >= limit {
            return Err(Error::InvalidParameter(format!(
                "{} already holds {} resources, the limit is {}",
                key, prior, limit
            )));
        }
        Ok(prior)
    }

    /// Take one away from the slot, deleting it when it reaches zero.
    #[instrument(skip(self, kit, txn), fields(rid = %kit.rid, key = %key))]
    pub async fn decrease_count(&self, kit: &Kit, txn: &mut dyn Txn, key: &LockKey) -> Result<()> {
        let count = kit
            .exec(txn.lock_count_for_update(key))
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("resource lock {}", key)))?;

        if count > 1 {
            let rows = kit.exec(txn.decrement_lock(key)).await?;
            if rows != 1 {
                return Err(Error::db(
                    kit,
                    format!("decrement of lock {} touched {} rows", key, rows),
                ));
            }
        } else {
            kit.exec(txn.delete_lock(key)).await?;
        }
        Ok(())
    }

    /// Claim a unique slot. Returns `false` when someone already holds it.
    #[instrument(skip(self, kit, txn), fields(rid = %kit.rid, key = %key))]
    pub async fn add_unique(&self, kit: &Kit, txn: &mut dyn Txn, key: &LockKey) -> Result<bool> {
        let row = ResourceLockRow {
            id: self.ids.one(kit, IdKind::ResourceLocks).await?,
            key: key.clone(),
            res_count: 1,
        };
        match kit.within(txn.insert_lock(&row)).await? {
            Ok(()) => Ok(true),
            Err(e) if e.is_duplicate_key() => Ok(false),
            Err(e) => Err(Error::db(kit, e)),
        }
    }

    /// Release a unique slot.
    #[instrument(skip(self, kit, txn), fields(rid = %kit.rid, key = %key))]
    pub async fn delete_unique(&self, kit: &Kit, txn: &mut dyn Txn, key: &LockKey) -> Result<()> {
        let count = kit
            .exec(txn.lock_count_for_update(key))
            .await?
            .ok_or_else(|| Error::RecordNotFound(format!("resource lock {}", key)))?;
        if count != 1 {
            return Err(Error::db(
                kit,
                format!("unique lock {} holds count {}", key, count),
            ));
        }
        kit.exec(txn.delete_lock(key)).await?;
        Ok(())
    }

    /// Drop the slot whatever it holds, e.g. when its parent is deleted.
    #[instrument(skip(self, kit, txn), fields(rid = %kit.rid, key = %key))]
    pub async fn truncate_count(&self, kit: &Kit, txn: &mut dyn Txn, key: &LockKey) -> Result<()> {
        kit.exec(txn.delete_lock(key)).await?;
        Ok(())
    }
}

/// Keys of the slots entity operations take.
pub mod lock_key {
    use cfgplane_store::LockKey;

    pub const CONFIG_ITEM_COUNT: &str = "config_item_count";
    pub const STRATEGY_SET_COUNT: &str = "strategy_set_count";
    pub const STRATEGY_COUNT: &str = "strategy_count";
    pub const DEFAULT_STRATEGY: &str = "default_strategy";
    pub const NAMESPACE: &str = "namespace";
    pub const APP_NAME: &str = "app_name";

    /// Config items of an app.
    pub fn config_items(biz_id: u32, app_id: u32) -> LockKey {
        LockKey::new(biz_id, CONFIG_ITEM_COUNT, app_id.to_string())
    }

    /// Strategy sets of an app.
    pub fn strategy_sets(biz_id: u32, app_id: u32) -> LockKey {
        LockKey::new(biz_id, STRATEGY_SET_COUNT, app_id.to_string())
    }

    /// Strategies of a strategy set.
    pub fn strategies(biz_id: u32, strategy_set_id: u32) -> LockKey {
        LockKey::new(biz_id, STRATEGY_COUNT, strategy_set_id.to_string())
    }

    /// The single default strategy of a set.
    pub fn default_strategy(biz_id: u32, strategy_set_id: u32) -> LockKey {
        LockKey::new(biz_id, DEFAULT_STRATEGY, strategy_set_id.to_string())
    }

    /// A namespace used by at most one strategy of a set.
    pub fn namespace(biz_id: u32, strategy_set_id: u32, namespace: &str) -> LockKey {
        LockKey::new(biz_id, NAMESPACE, format!("{}/{}", strategy_set_id, namespace))
    }

    /// App names are unique inside a tenant.
    pub fn app_name(biz_id: u32, name: &str) -> LockKey {
        LockKey::new(biz_id, APP_NAME, name)
    }
}
