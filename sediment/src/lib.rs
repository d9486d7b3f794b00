//! # Sediment
//!
//! Schema migrations that can be re-run against any database state.
//!
//! Every operation checks the live schema before it runs, so a descriptor
//! applied twice, or applied over changes made by hand, converges instead
//! of failing. The engine lives in `sediment_core`; backends are enabled
//! with the `in-memory` and `sqlx` features.

#![deny(missing_docs)]

pub use sediment_core::*;

#[cfg(feature = "in-memory")]
/// The in-memory backend.
pub mod mem {
    //! Contains the in-memory backend, for tests and dry experiments.
    pub use sediment_mem::*;
}

#[cfg(feature = "sqlx")]
/// The sqlx backend.
pub mod sql {
    //! Contains the SQLite, MySQL and PostgreSQL backend.
    pub use sediment_sqlx::*;
}

pub mod prelude {
    //! The prelude module for the `sediment` crate.
    pub use sediment_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::InMemoryBackend;
    #[cfg(feature = "sqlx")]
    pub use super::sql::SqlxBackend;
}
