//! Monotonic id allocation backed by the `id_generators` table.
//!
//! Every batch runs in its own short transaction on the admin shard so the
//! counter row lock is never held across a caller's business transaction.
//! Ids are unique per kind across all shards and never reused, but gaps are
//! allowed: ids handed to a transaction that later rolls back are lost.

use std::sync::Arc;

use cfgplane_store::{IdKind, Shard};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::kit::Kit;
use crate::obs;

#[derive(Clone)]
pub struct IdGenerator {
    admin: Arc<dyn Shard>,
}

impl IdGenerator {
    /// Allocate from the counters on `admin`.
    pub fn new(admin: Arc<dyn Shard>) -> Self {
        Self { admin }
    }

    /// Allocate `n` contiguous ids, ascending.
    #[instrument(skip(self, kit), fields(rid = %kit.rid, kind = %kind))]
    pub async fn batch(&self, kit: &Kit, kind: IdKind, n: u32) -> Result<Vec<u32>> {
        if n == 0 {
            return Err(Error::InvalidParameter(format!(
                "id batch size for {} must be positive",
                kind
            )));
        }

        let mut txn = kit.exec(self.admin.begin()).await?;
        let rows = kit.exec(txn.bump_counter(kind, n)).await?;
        if rows == 0 {
            // Counters are seeded at deploy time; a missing one is misconfiguration.
            return Err(Error::InvalidParameter(format!(
                "id generator for {} is not seeded",
                kind
            )));
        }
        let max = kit
            .exec(txn.read_counter(kind))
            .await?
            .ok_or_else(|| Error::db(kit, format!("id counter {} vanished", kind)))?;
        kit.exec(txn.commit()).await?;

        let first = max
            .checked_sub(n - 1)
            .ok_or_else(|| Error::db(kit, format!("id counter {} is below {}", kind, n)))?;
        obs::emit_ids_allocated(&kit.rid, kind.as_str(), first, n);
        Ok((first..=max).collect())
    }

    /// Allocate a single id.
    pub async fn one(&self, kit: &Kit, kind: IdKind) -> Result<u32> {
        let ids = self.batch(kit, kind, 1).await?;
        ids.first()
            .copied()
            .ok_or_else(|| Error::db(kit, format!("empty id batch for {}", kind)))
    }
}
