//! # Sediment SQL backend
//!
//! A [`Backend`](sediment_core::Backend) over sqlx's `Any` driver, for
//! SQLite, MySQL and PostgreSQL.
//!
//! The dialect is picked from the connection URL. It decides how
//! operations are rendered as DDL, how the schema is introspected and
//! whether a descriptor runs inside a transaction: SQLite and PostgreSQL
//! roll back DDL, MySQL commits every statement as it runs.
//!
//! ```ignore
//! use sediment_core::prelude::*;
//! use sediment_sqlx::SqlxBackend;
//!
//! let config = MigratorConfig::default();
//! let backend = SqlxBackend::connect("sqlite://shop.db?mode=rwc", config.ledger_tables()).await?;
//! let migrator = Migrator::new(backend, descriptors, config);
//! migrator.migrate(&CancellationToken::new()).await?;
//! ```

#![deny(missing_docs)]

mod backend;
pub mod ddl;
mod dialect;
mod introspect;
mod session;

pub use backend::*;
pub use dialect::Dialect;
pub use session::SqlxSession;
