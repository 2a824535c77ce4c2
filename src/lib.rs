//! An embeddable, in-process columnar storage engine with MVCC-style
//! historical reads and strict two-phase locked transactions.
//!
//! A [`Database`] owns a catalog of [`Table`]s. Reads and writes go through
//! a [`Query`] bound to one table, either directly (auto-committing) or as
//! part of a [`Transaction`] that locks the keys it touches and either
//! commits all of its operations or rolls every one of them back.
//! [`TransactionWorker`] runs a batch of transactions on a dedicated thread,
//! retrying aborted ones with fresh transaction IDs.

pub mod database;
pub mod error;
pub mod index;
pub mod lock_manager;
pub mod log;
pub mod page;
pub mod query;
pub mod table;
pub mod transaction;
pub mod transaction_worker;

/// A record identifier: an opaque, monotonically increasing handle into a
/// table's page directory. Never reused, even after the record it names is
/// deleted.
pub type Rid = u64;

pub use database::Database;
pub use error::{Error, Result};
pub use query::Query;
pub use table::{Record, Table};
pub use transaction::{Operation, Transaction};
pub use transaction_worker::TransactionWorker;
