//! Transaction retry wrapper.
//!
//! Mutating operations are written as a `TxnJob`: a body that runs inside one
//! transaction. `run_in_txn` begins the transaction, runs the body, commits
//! on success and rolls back on error. A body that reports
//! `Error::RetryTransaction` is re-run from scratch in a new transaction, so
//! the sentinel never reaches end callers.

use std::time::Duration;

use async_trait::async_trait;
use cfgplane_store::{Shard, Txn};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kit::Kit;
use crate::obs;

/// The body of one transactional operation. Must be safe to re-run.
#[async_trait]
pub trait TxnJob: Send {
    type Output: Send;

    async fn run(&mut self, kit: &Kit, txn: &mut dyn Txn) -> Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Pause before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run `job` in a transaction on `shard`, re-running it on `RetryTransaction`.
pub async fn run_in_txn<J>(
    shard: &dyn Shard,
    kit: &Kit,
    policy: &RetryPolicy,
    job: &mut J,
) -> Result<J::Output>
where
    J: TxnJob,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let mut txn = kit.exec(shard.begin()).await?;
        match job.run(kit, txn.as_mut()).await {
            Ok(output) => {
                kit.exec(txn.commit()).await?;
                return Ok(output);
            }
            Err(Error::RetryTransaction) => {
                rollback(kit, txn).await;
                if attempt < attempts {
                    obs::emit_txn_retry(&kit.rid, shard.id(), attempt);
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
            Err(err) => {
                rollback(kit, txn).await;
                return Err(err);
            }
        }
    }

    obs::emit_txn_retries_exhausted(&kit.rid, shard.id(), attempts);
    Err(Error::DbOpFailed {
        rid: kit.rid.clone(),
        message: format!("transaction still conflicting after {} attempts", attempts),
    })
}

async fn rollback(kit: &Kit, txn: Box<dyn Txn>) {
    // A failed rollback leaves the server to discard the transaction.
    if let Err(e) = txn.rollback().await {
        debug!(rid = %kit.rid, error = %e, "rollback failed");
    }
}
