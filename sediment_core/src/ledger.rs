//! Ledger records and the bootstrap descriptor that creates the ledger.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::descriptor::Descriptor;
use crate::operation::Operation;
use crate::schema::{ColumnDef, ColumnType, TableDef};

/// Record of a descriptor that has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Descriptor id.
    pub id: String,
    /// Descriptor name at the time it was applied.
    pub name: String,
    /// Batch the descriptor was applied in.
    pub batch: i64,
    /// When the descriptor was applied.
    pub applied_at: DateTime<Utc>,
    /// Checksum of the descriptor when it was applied.
    pub checksum: String,
}

impl MigrationRecord {
    /// Record for `descriptor` applied now in `batch`.
    pub fn new(descriptor: &Descriptor, batch: i64) -> Self {
        Self {
            id: descriptor.id().to_string(),
            name: descriptor.name().to_string(),
            batch,
            applied_at: Utc::now(),
            checksum: descriptor.checksum(),
        }
    }
}

/// A group of descriptors applied in one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Batch number, increasing with every run that applied something.
    pub number: i64,
    /// Ids of the descriptors in the batch.
    pub ids: BTreeSet<String>,
}

/// Names of the bookkeeping tables, prefix already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTables {
    /// Table holding one row per applied descriptor.
    pub ledger: String,
    /// Table holding the "migration in progress" row.
    pub lock: String,
}

impl Default for LedgerTables {
    fn default() -> Self {
        Self {
            ledger: "migrations".to_string(),
            lock: "migrations_lock".to_string(),
        }
    }
}

/// Id of the bootstrap descriptor. Sorts before any real id and is never
/// recorded in the ledger.
pub const BOOTSTRAP_ID: &str = "0000_bootstrap";

/// The zeroth descriptor: creates the ledger and lock tables if absent.
pub fn bootstrap_descriptor(tables: &LedgerTables) -> Descriptor {
    let ledger = TableDef::new(tables.ledger.clone())
        .column(ColumnDef::new("id", ColumnType::String(191)).primary_key())
        .column(ColumnDef::new("descriptor_name", ColumnType::String(255)))
        .column(ColumnDef::new("batch_number", ColumnType::BigInteger))
        .column(ColumnDef::new("applied_at", ColumnType::String(64)))
        .column(ColumnDef::new("checksum", ColumnType::String(64)));

    let lock = TableDef::new(tables.lock.clone())
        .column(ColumnDef::new("lock_key", ColumnType::String(64)).primary_key())
        .column(ColumnDef::new("owner", ColumnType::String(64)))
        .column(ColumnDef::new("acquired_at", ColumnType::BigInteger));

    Descriptor::new(BOOTSTRAP_ID, "create_ledger_tables")
        .up(Operation::create_table(ledger))
        .up(Operation::create_table(lock))
}
