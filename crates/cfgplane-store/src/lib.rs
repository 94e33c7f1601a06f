//! cfgplane-store: Sharded relational persistence for cfgplane
//!
//! This crate owns every row the configuration control plane persists and
//! the transaction seam the consistency primitives are written against.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: row-level locking, unique-key collisions, and transaction
//! visibility. No business branching lives here.
//!
//! ## Key Components
//!
//! - `Shard` / `Txn`: the transaction seam, one method per statement
//! - `ShardResolver`: tenant to shard mapping
//! - `MemoryShard`: in-process backend with row-lock semantics
//! - `PgShard`: PostgreSQL backend over a `deadpool-postgres` pool
//! - `DbConfig`: connection settings from the environment

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
pub mod postgres;
mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::MemoryShard;
pub use handle::DbConfig;
pub use postgres::PgShard;
pub use schema::*;
pub use storage_traits::{Shard, ShardResolver, StaticShardResolver, StorageResult, Txn};
