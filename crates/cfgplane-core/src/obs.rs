//! Structured observability hooks for the consistency primitives.
//!
//! This module provides:
//! - Request-scoped tracing spans via the `RequestSpan` RAII guard
//! - Emission functions for lifecycle events: id allocation, lock retries,
//!   transaction retries, outbox fire/finalize, publishing and maintenance
//!
//! Events are emitted at `info!` level unless they report a problem
//! (configurable via the `CFGPLANE_LOG` env var).

use tracing::{debug, info, warn};

/// RAII guard that enters a request-scoped span for the duration of a call.
///
/// # Example
///
/// ```ignore
/// let _span = RequestSpan::enter(&kit.rid);
/// // every tracing call below is tagged with rid
/// ```
pub struct RequestSpan {
    _span: tracing::span::EnteredSpan,
}

impl RequestSpan {
    pub fn enter(rid: &str) -> Self {
        Self {
            _span: request_span(rid).entered(),
        }
    }
}

/// The request span itself, for futures that must stay `Send`.
pub fn request_span(rid: &str) -> tracing::Span {
    tracing::info_span!("cfgplane.request", rid = %rid)
}

/// Emit event: a contiguous id range was handed out.
pub fn emit_ids_allocated(rid: &str, kind: &str, first: u32, count: u32) {
    debug!(event = "ids.allocated", rid = %rid, kind = %kind, first = first, count = count);
}

/// Emit event: a concurrent first insert of a lock slot forced a retry.
pub fn emit_lock_retry(rid: &str, key: &dyn std::fmt::Display) {
    info!(event = "lock.retry_txn", rid = %rid, key = %key);
}

/// Emit event: the retry wrapper is re-running a transaction.
pub fn emit_txn_retry(rid: &str, shard: u32, attempt: u32) {
    info!(event = "txn.retry", rid = %rid, shard = shard, attempt = attempt);
}

/// Emit event: the retry wrapper gave up.
pub fn emit_txn_retries_exhausted(rid: &str, shard: u32, attempts: u32) {
    warn!(event = "txn.retries_exhausted", rid = %rid, shard = shard, attempts = attempts);
}

pub fn emit_events_fired(rid: &str, shard: u32, count: usize) {
    info!(event = "outbox.fired", rid = %rid, shard = shard, count = count);
}

pub fn emit_events_finalized(rid: &str, shard: u32, status: &str, updated: u64) {
    info!(
        event = "outbox.finalized",
        rid = %rid,
        shard = shard,
        status = %status,
        updated = updated,
    );
}

/// Emit event: some fired events were already settled (by the stale sweep)
/// and kept their status.
pub fn emit_finalize_skipped(rid: &str, shard: u32, skipped: u64) {
    warn!(event = "outbox.finalize_skipped", rid = %rid, shard = shard, skipped = skipped);
}

/// Emit event: finalizing fired events failed (warning level).
///
/// The owning transaction has already concluded, so this is reported and
/// left to the stale-event sweep.
pub fn emit_finalize_error(rid: &str, shard: u32, error: &dyn std::fmt::Display) {
    warn!(event = "outbox.finalize_error", rid = %rid, shard = shard, error = %error);
}

pub fn emit_cursor_recorded(rid: &str, shard: u32, cursor: u32) {
    info!(event = "outbox.cursor_recorded", rid = %rid, shard = shard, cursor = cursor);
}

pub fn emit_purge_finished(rid: &str, shard: u32, through: u32, deleted: u64) {
    info!(
        event = "outbox.purged",
        rid = %rid,
        shard = shard,
        through = through,
        deleted = deleted,
    );
}

pub fn emit_unknown_swept(rid: &str, shard: u32, failed: u64) {
    if failed > 0 {
        warn!(event = "outbox.unknown_swept", rid = %rid, shard = shard, failed = failed);
    } else {
        debug!(event = "outbox.unknown_swept", rid = %rid, shard = shard, failed = failed);
    }
}

/// Emit event: a strategy was published, with its new revision.
pub fn emit_strategy_published(rid: &str, strategy_id: u32, revision: u32, history_id: u32) {
    info!(
        event = "publish.published",
        rid = %rid,
        strategy_id = strategy_id,
        revision = revision,
        history_id = history_id,
    );
}

pub fn emit_publish_finished(rid: &str, strategy_id: u32) {
    info!(event = "publish.finished", rid = %rid, strategy_id = strategy_id);
}

pub fn emit_strategy_created(rid: &str, biz_id: u32, strategy_id: u32) {
    info!(event = "strategy.created", rid = %rid, biz_id = biz_id, strategy_id = strategy_id);
}

pub fn emit_strategy_deleted(rid: &str, biz_id: u32, strategy_id: u32, was_published: bool) {
    info!(
        event = "strategy.deleted",
        rid = %rid,
        biz_id = biz_id,
        strategy_id = strategy_id,
        was_published = was_published,
    );
}
