//! SQLite storage for the Strata pipeline
//!
//! This crate implements every store trait from `strata-core` on top of a
//! single SQLite database:
//! - Tenant directory
//! - Append-only raw events with retry bookkeeping
//! - Staging records (unique per raw event)
//! - Hubs, links and satellites of the business layer
//! - The sliding-window rate-limit log
//!
//! Get-or-create semantics rely on uniqueness constraints and
//! `ON CONFLICT DO NOTHING`, never on read-then-write checks, so concurrent
//! workers sharing one database converge.
//!
//! # Example
//! ```no_run
//! # use strata_store_sqlite::SqliteStore;
//! # async fn example() -> strata_core::Result<()> {
//! let store = SqliteStore::new("~/.strata/strata.db").await?;
//! # Ok(())
//! # }
//! ```

pub mod migrations;
mod sqlite_store;

pub use sqlite_store::{SqliteStore, SqliteStoreConfig};
