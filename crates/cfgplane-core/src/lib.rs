//! cfgplane Core Library
//!
//! The consistency primitives every entity operation of the configuration
//! control plane composes:
//!
//! - [`IdGenerator`]: monotonic, cross-shard unique ids per resource kind
//! - [`ResourceLock`]: per-tenant counting and uniqueness slots
//! - [`EventOutbox`]: transactional outbox with a per-shard consumer cursor
//! - [`PublishController`]: the strategy publish state machine
//!
//! plus the request [`Kit`], the transaction retry wrapper and
//! [`StrategyStore`], which shows the primitives composed into one entity.

pub mod audit;
pub mod error;
pub mod event;
pub mod id;
pub mod kit;
pub mod lock;
pub mod obs;
pub mod publish;
pub mod strategy;
pub mod telemetry;
pub mod txn;

use std::sync::Arc;

use cfgplane_store::ShardResolver;

pub use audit::{AuditAction, AuditBuilder, AuditResource, FieldChange, FieldChanges};
pub use error::{Error, Result};
pub use event::{EventOutbox, EventSpec, FiredEvents, PURGE_BATCH};
pub use id::IdGenerator;
pub use kit::Kit;
pub use lock::{lock_key, ResourceLock};
pub use publish::{PublishController, PublishOption};
pub use strategy::{CreateStrategyOption, StrategyLimits, StrategyStore};
pub use txn::{run_in_txn, RetryPolicy, TxnJob};

/// Every primitive wired against one shard layout.
#[derive(Clone)]
pub struct ControlPlane {
    pub resolver: Arc<dyn ShardResolver>,
    pub ids: IdGenerator,
    pub locks: ResourceLock,
    pub outbox: EventOutbox,
    pub publish: PublishController,
    pub strategies: StrategyStore,
}

impl ControlPlane {
    /// Wire the primitives; id counters live on the resolver's admin shard.
    pub fn new(resolver: Arc<dyn ShardResolver>) -> Self {
        let ids = IdGenerator::new(resolver.admin());
        let locks = ResourceLock::new(ids.clone());
        let outbox = EventOutbox::new(ids.clone());
        let publish = PublishController::new(resolver.clone(), ids.clone(), outbox.clone());
        let strategies =
            StrategyStore::new(resolver.clone(), ids.clone(), locks.clone(), outbox.clone());
        Self {
            resolver,
            ids,
            locks,
            outbox,
            publish,
            strategies,
        }
    }

    /// Apply one retry policy to every transactional operation.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.publish = self.publish.with_retry(retry);
        self.strategies = self.strategies.with_retry(retry);
        self
    }
}
