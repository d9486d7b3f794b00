//! # Sediment
//!
//! Ordered, idempotent, reversible schema migrations.
//!
//! A [`Descriptor`] is a named change unit with forward and reverse
//! [`Operation`]s. The [`Migrator`] plans which descriptors are pending,
//! applies them in id order under a migration lock and records each one in
//! a ledger that lives in the migrated database. Every operation is checked
//! against the live schema first, so re-running a descriptor that was
//! partially applied is safe.

#![deny(missing_docs)]

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod loader;
pub mod lock;
pub mod migrator;
pub mod operation;
pub mod planner;
pub mod schema;

pub use backend::{Backend, BackendError, BoxError, Introspector, Ledger, MigrationLock, Session};
pub use config::MigratorConfig;
pub use descriptor::{Descriptor, DescriptorError, Guard, Step};
pub use error::{MigrationError, PlanningError};
pub use executor::{ExecuteError, ExecutionSummary, apply_forward, apply_reverse};
pub use ledger::{Batch, LedgerTables, MigrationRecord};
pub use loader::LoaderError;
pub use migrator::{
    DescriptorStatus, MigrateOptions, MigrateReport, MigrationState, Migrator, RollbackReport,
};
pub use operation::Operation;
pub use schema::{
    ColumnDef, ColumnType, ForeignKey, IndexDef, ReferentialAction, SchemaSnapshot, TableDef,
    TableSnapshot,
};

/// Re-exported so callers can cancel runs without depending on
/// `tokio-util` themselves.
pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    //! The prelude module for the `sediment_core` crate.
    pub use super::{
        Backend, CancellationToken, ColumnDef, ColumnType, Descriptor, ForeignKey, IndexDef,
        MigrateOptions, MigrationError, Migrator, MigratorConfig, Operation, ReferentialAction,
        TableDef,
    };
}
