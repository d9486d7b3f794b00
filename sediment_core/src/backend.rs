//! Traits implemented by storage backends.
//!
//! The engine never talks SQL itself. It asks an [`Introspector`] what the
//! schema looks like, hands [`Operation`]s to a [`Session`] and reads the
//! [`Ledger`]. A backend bundles those behind [`Backend`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::ledger::{Batch, LedgerTables, MigrationRecord};
use crate::operation::Operation;
use crate::schema::SchemaSnapshot;

/// Boxed error source carried by [`BackendError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The database could not be reached.
    #[error("connection error: {0}")]
    Connection(#[source] BoxError),
    /// A statement or metadata query failed.
    #[error("database error: {0}")]
    Query(#[source] BoxError),
    /// The schema is in a state the operation cannot reconcile.
    #[error("{0}")]
    Conflict(String),
    /// The backend cannot express the operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Whether the error means the database is unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, BackendError::Connection(_))
    }
}

/// Read-only questions about the live schema.
///
/// A metadata lookup that finds nothing answers `false`; only failures to
/// ask are errors.
#[async_trait]
pub trait Introspector: Send {
    /// Whether `table` exists.
    async fn table_exists(&mut self, table: &str) -> Result<bool, BackendError>;
    /// Whether `table` has `column`. `false` when the table is missing.
    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, BackendError>;
    /// Whether `table` has an index called `index`. Backends that cannot tell
    /// answer `false`.
    async fn index_exists(&mut self, table: &str, index: &str) -> Result<bool, BackendError>;
    /// Number of rows in `table`.
    async fn row_count(&mut self, table: &str) -> Result<u64, BackendError>;
}

/// One connection applying one descriptor.
///
/// When the backend supports transactional DDL the session is a
/// transaction: dropping it without [`Session::commit`] discards its work.
/// Otherwise each statement takes effect immediately.
#[async_trait]
pub trait Session: Introspector {
    /// Executes `operation` without any schema check.
    ///
    /// [`Operation::RecreateTable`] is decomposed by the executor and never
    /// reaches a session.
    async fn execute(&mut self, operation: &Operation) -> Result<(), BackendError>;
    /// Runs `statement`, which copies the rows of `from` into `into`.
    async fn copy_rows(&mut self, from: &str, into: &str, statement: &str)
    -> Result<(), BackendError>;
    /// Writes a ledger row.
    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<(), BackendError>;
    /// Deletes the ledger row of descriptor `id`, if present.
    async fn remove_record(&mut self, id: &str) -> Result<(), BackendError>;
    /// Makes the session's work durable.
    async fn commit(self: Box<Self>) -> Result<(), BackendError>;
}

/// Durable record of applied descriptors.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// All records, ordered by id.
    async fn applied(&self) -> Result<Vec<MigrationRecord>, BackendError>;

    /// Ids of all applied descriptors.
    async fn applied_set(&self) -> Result<HashSet<String>, BackendError> {
        Ok(self.applied().await?.into_iter().map(|r| r.id).collect())
    }

    /// The most recent batch, if anything was applied.
    async fn last_batch(&self) -> Result<Option<Batch>, BackendError> {
        let records = self.applied().await?;
        let Some(number) = records.iter().map(|r| r.batch).max() else {
            return Ok(None);
        };
        let ids = records
            .into_iter()
            .filter(|r| r.batch == number)
            .map(|r| r.id)
            .collect();
        Ok(Some(Batch { number, ids }))
    }

    /// Deletes every record of `batch`, returning how many were removed.
    async fn remove_batch(&self, batch: i64) -> Result<u64, BackendError>;
}

/// Mutual exclusion between concurrent runners.
#[async_trait]
pub trait MigrationLock: Send + Sync {
    /// Takes the lock for `owner`. A lock held longer than `stale_after` is
    /// considered abandoned and taken over. Returns `false` when another
    /// owner holds it.
    async fn try_lock(&self, owner: &str, stale_after: Duration) -> Result<bool, BackendError>;
    /// Refreshes the acquisition time of a lock held by `owner`. Returns
    /// `false` when `owner` no longer holds it.
    async fn renew(&self, owner: &str) -> Result<bool, BackendError>;
    /// Releases the lock if `owner` holds it.
    async fn unlock(&self, owner: &str) -> Result<(), BackendError>;
}

/// A database the migrator can work against.
#[async_trait]
pub trait Backend: Ledger + MigrationLock {
    /// Names of the bookkeeping tables this backend reads and writes.
    fn ledger_tables(&self) -> &LedgerTables;
    /// Whether DDL statements can be rolled back.
    fn transactional_ddl(&self) -> bool;
    /// Opens a session.
    async fn begin(&self) -> Result<Box<dyn Session + '_>, BackendError>;
    /// Introspects the whole schema.
    async fn snapshot(&self) -> Result<SchemaSnapshot, BackendError>;
}
