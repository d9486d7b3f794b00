//! # Sediment memory backend
//!
//! An in-memory implementation of sediment's [`Backend`](sediment_core::Backend),
//! primarily for testing.
//!
//! The backend models a schema (tables, columns, indexes and a row count
//! per table), the ledger and the migration lock. Statements are checked the
//! way a database would check them: creating a table that exists or
//! dropping a column that does not is an error.
//!
//! # Transactions
//!
//! By default sessions are transactional: a session works on a copy of the
//! schema and ledger and publishes it on commit. Use
//! [`InMemoryBackend::non_transactional`] to model engines such as MySQL,
//! where every statement takes effect immediately and a failing descriptor
//! leaves partial work behind.
//!
//! ```ignore
//! use sediment_core::prelude::*;
//! use sediment_mem::InMemoryBackend;
//!
//! let backend = InMemoryBackend::default();
//! let migrator = Migrator::new(backend, descriptors, MigratorConfig::default());
//! migrator.migrate(&CancellationToken::new()).await?;
//! ```

#![deny(missing_docs)]

mod backend;
mod session;
mod state;

pub use backend::*;
pub use session::*;
pub use state::InMemoryBackendError;
