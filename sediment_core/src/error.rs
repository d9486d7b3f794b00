//! Errors surfaced by the migrator.

use crate::backend::BackendError;
use crate::descriptor::DescriptorError;

/// Errors raised while planning a run.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    /// Two descriptors share an id.
    #[error("duplicate descriptor id {id} ('{first}' and '{second}')")]
    DuplicateId {
        /// The shared id.
        id: String,
        /// Name of the first descriptor with that id.
        first: String,
        /// Name of the second descriptor with that id.
        second: String,
    },

    /// An applied descriptor was edited after it ran.
    #[error("descriptor {id} ({name}) checksum mismatch: recorded {recorded}, found {found}")]
    ChecksumMismatch {
        /// Descriptor id.
        id: String,
        /// Descriptor name.
        name: String,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum of the descriptor as currently defined.
        found: String,
    },

    /// The ledger references a descriptor that is no longer defined.
    #[error("ledger references unknown descriptor {id} ({name})")]
    UnknownDescriptor {
        /// Id stored in the ledger.
        id: String,
        /// Name stored in the ledger.
        name: String,
    },

    /// A descriptor failed validation.
    #[error(transparent)]
    InvalidDescriptor(#[from] DescriptorError),

    /// The ledger could not be read.
    #[error("ledger unreadable: {0}")]
    Ledger(#[source] BackendError),
}

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The database could not be reached. Nothing was changed by the failing
    /// step; retrying is safe.
    #[error(transparent)]
    Connection(BackendError),

    /// The run could not be planned.
    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    /// A descriptor failed to apply or revert.
    #[error("descriptor {id} ({name}) failed at '{operation}': {source}")]
    Operation {
        /// Descriptor id.
        id: String,
        /// Descriptor name.
        name: String,
        /// The step that failed.
        operation: String,
        /// What went wrong.
        #[source]
        source: BackendError,
    },

    /// Another runner holds the migration lock.
    #[error("migration lock is held by another runner (gave up after {attempts} attempts)")]
    LockContention {
        /// Number of acquisition attempts made.
        attempts: u32,
    },

    /// The migration lock was taken over while the run held it. The run
    /// stopped at the next descriptor boundary.
    #[error("lost the migration lock held as {owner}")]
    LockLost {
        /// Identity the lock was held under.
        owner: String,
    },

    /// The caller cancelled the run between descriptors.
    #[error("cancelled with {remaining} descriptor(s) left")]
    Cancelled {
        /// Descriptors that were not attempted.
        remaining: usize,
    },
}

impl MigrationError {
    /// Whether running again later may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::Connection(_) | MigrationError::LockContention { .. }
        )
    }

    /// Id of the descriptor that failed, when the error is tied to one.
    pub fn descriptor_id(&self) -> Option<&str> {
        match self {
            MigrationError::Operation { id, .. } => Some(id),
            MigrationError::Planning(PlanningError::DuplicateId { id, .. })
            | MigrationError::Planning(PlanningError::ChecksumMismatch { id, .. })
            | MigrationError::Planning(PlanningError::UnknownDescriptor { id, .. }) => Some(id),
            _ => None,
        }
    }

    /// Wraps a backend error raised outside of any descriptor.
    pub(crate) fn from_backend(err: BackendError) -> Self {
        if err.is_connection() {
            MigrationError::Connection(err)
        } else {
            MigrationError::Planning(PlanningError::Ledger(err))
        }
    }

    /// Wraps a backend error raised while applying or reverting a descriptor.
    pub(crate) fn for_descriptor(
        id: &str,
        name: &str,
        operation: impl Into<String>,
        err: BackendError,
    ) -> Self {
        if err.is_connection() {
            MigrationError::Connection(err)
        } else {
            MigrationError::Operation {
                id: id.to_string(),
                name: name.to_string(),
                operation: operation.into(),
                source: err,
            }
        }
    }
}
