//! Orchestrates a migration run: bootstrap, lock, plan, execute, record.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::config::MigratorConfig;
use crate::descriptor::Descriptor;
use crate::error::{MigrationError, PlanningError};
use crate::executor::{ExecutionSummary, apply_forward, apply_reverse};
use crate::ledger::{MigrationRecord, bootstrap_descriptor};
use crate::lock::{self, LockGuard, heartbeat_interval};
use crate::planner;
use crate::schema::SchemaSnapshot;

/// Options for [`Migrator::migrate_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Record every descriptor in its own batch so each can be rolled back
    /// on its own.
    pub step: bool,
    /// Plan only. Nothing is executed and no lock is taken.
    pub dry_run: bool,
}

/// Outcome of a migrate run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateReport {
    /// Ids of the pending descriptors, in execution order.
    pub planned: Vec<String>,
    /// Ids of the descriptors that were applied.
    pub applied: Vec<String>,
    /// Batch numbers written by this run.
    pub batches: Vec<i64>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

impl MigrateReport {
    /// Whether there was nothing to do.
    pub fn is_noop(&self) -> bool {
        self.planned.is_empty()
    }
}

/// Outcome of a rollback run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Batches removed from the ledger, latest first.
    pub batches: Vec<i64>,
    /// Ids of the reverted descriptors, in revert order.
    pub reverted: Vec<String>,
}

/// Where a descriptor stands relative to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    /// Applied in `batch`.
    Applied {
        /// Batch number.
        batch: i64,
        /// When it was applied.
        applied_at: DateTime<Utc>,
    },
    /// Not applied yet.
    Pending,
    /// Recorded in the ledger but no longer defined.
    Orphaned {
        /// Batch number.
        batch: i64,
        /// When it was applied.
        applied_at: DateTime<Utc>,
    },
}

/// One line of [`Migrator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorStatus {
    /// Descriptor id.
    pub id: String,
    /// Descriptor name.
    pub name: String,
    /// Ledger state.
    pub state: MigrationState,
}

/// Runs descriptors against a backend.
///
/// Descriptors are held as authored; the configured table prefix is applied
/// when each one is executed.
pub struct Migrator<B: Backend> {
    backend: B,
    descriptors: Vec<Descriptor>,
    config: MigratorConfig,
}

impl<B: Backend> Migrator<B> {
    /// Creates a migrator over `descriptors`, in any order.
    pub fn new(backend: B, descriptors: Vec<Descriptor>, config: MigratorConfig) -> Self {
        if *backend.ledger_tables() != config.ledger_tables() {
            warn!(
                "Backend ledger tables {:?} differ from configured {:?}; using the backend's",
                backend.ledger_tables(),
                config.ledger_tables()
            );
        }
        Self {
            backend,
            descriptors,
            config,
        }
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The configuration.
    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// The descriptors, as supplied.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Creates the ledger and lock tables if they do not exist yet.
    pub async fn bootstrap(&self) -> Result<(), MigrationError> {
        let descriptor = bootstrap_descriptor(self.backend.ledger_tables());
        let summary = self
            .run_session(&descriptor, &descriptor, None, Direction::Forward)
            .await?;
        if summary.executed > 0 {
            info!("Created migration ledger {}", self.backend.ledger_tables().ledger);
        }
        Ok(())
    }

    /// Applies every pending descriptor in one batch.
    pub async fn migrate(&self, cancel: &CancellationToken) -> Result<MigrateReport, MigrationError> {
        self.migrate_with(MigrateOptions::default(), cancel).await
    }

    /// Applies every pending descriptor.
    ///
    /// `cancel` is checked before each descriptor. Descriptors applied
    /// before cancellation or failure stay applied.
    pub async fn migrate_with(
        &self,
        options: MigrateOptions,
        cancel: &CancellationToken,
    ) -> Result<MigrateReport, MigrationError> {
        if options.dry_run {
            let applied = self.read_ledger().await?;
            let pending = planner::plan(&self.descriptors, &applied, self.config.verify_checksums)?;
            return Ok(MigrateReport {
                planned: pending.iter().map(|d| d.id().to_string()).collect(),
                dry_run: true,
                ..Default::default()
            });
        }

        self.bootstrap().await?;
        let guard = self.lock().await?;
        let stop = cancel.child_token();
        let result = guard
            .hold_while(self.migrate_locked(options, &stop), self.heartbeat(), &stop)
            .await;
        release(guard, result).await
    }

    async fn migrate_locked(
        &self,
        options: MigrateOptions,
        cancel: &CancellationToken,
    ) -> Result<MigrateReport, MigrationError> {
        let applied = self
            .backend
            .applied()
            .await
            .map_err(MigrationError::from_backend)?;
        let pending = planner::plan(&self.descriptors, &applied, self.config.verify_checksums)?;

        let mut report = MigrateReport {
            planned: pending.iter().map(|d| d.id().to_string()).collect(),
            ..Default::default()
        };
        if pending.is_empty() {
            info!("Nothing to migrate");
            return Ok(report);
        }

        let mut batch = applied.iter().map(|r| r.batch).max().unwrap_or(0);
        if !options.step {
            batch += 1;
            info!("Migrating {} descriptor(s) in batch {}", pending.len(), batch);
        }

        for (index, descriptor) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                let remaining = pending.len() - index;
                warn!("Cancelled with {} descriptor(s) left", remaining);
                return Err(MigrationError::Cancelled { remaining });
            }
            if options.step {
                batch += 1;
            }
            info!(
                "Applying {} ({}) in batch {}",
                descriptor.id(),
                descriptor.name(),
                batch
            );
            let prefixed = descriptor.with_prefix(&self.config.table_prefix);
            let summary = self
                .run_session(descriptor, &prefixed, Some(batch), Direction::Forward)
                .await?;
            info!(
                "Applied {} ({}): {} executed, {} skipped",
                descriptor.id(),
                descriptor.name(),
                summary.executed,
                summary.skipped
            );
            report.applied.push(descriptor.id().to_string());
            if report.batches.last() != Some(&batch) {
                report.batches.push(batch);
            }
        }
        Ok(report)
    }

    /// Reverts the latest `batches` batches, latest first.
    ///
    /// Each descriptor's ledger record is removed together with its revert,
    /// so a cancelled or failed rollback leaves the ledger matching the
    /// schema.
    pub async fn rollback(
        &self,
        batches: usize,
        cancel: &CancellationToken,
    ) -> Result<RollbackReport, MigrationError> {
        self.bootstrap().await?;
        let guard = self.lock().await?;
        let stop = cancel.child_token();
        let result = guard
            .hold_while(self.rollback_locked(Some(batches), &stop), self.heartbeat(), &stop)
            .await;
        release(guard, result).await
    }

    /// Reverts every batch.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<RollbackReport, MigrationError> {
        self.bootstrap().await?;
        let guard = self.lock().await?;
        let stop = cancel.child_token();
        let result = guard
            .hold_while(self.rollback_locked(None, &stop), self.heartbeat(), &stop)
            .await;
        release(guard, result).await
    }

    /// Takes the migration lock under a fresh owner id.
    async fn lock(&self) -> Result<LockGuard<'_, B>, MigrationError> {
        let owner = Uuid::new_v4().to_string();
        lock::acquire(&self.backend, &owner, &self.config).await
    }

    fn heartbeat(&self) -> std::time::Duration {
        heartbeat_interval(self.config.lock_stale_after)
    }

    async fn rollback_locked(
        &self,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<RollbackReport, MigrationError> {
        let applied = self
            .backend
            .applied()
            .await
            .map_err(MigrationError::from_backend)?;
        planner::plan(&self.descriptors, &applied, self.config.verify_checksums)?;

        let mut report = RollbackReport::default();
        while limit.is_none_or(|limit| report.batches.len() < limit) {
            let Some(batch) = self
                .backend
                .last_batch()
                .await
                .map_err(MigrationError::from_backend)?
            else {
                break;
            };

            let mut descriptors = Vec::with_capacity(batch.ids.len());
            for id in batch.ids.iter().rev() {
                match self.descriptors.iter().find(|d| d.id() == id) {
                    Some(descriptor) => descriptors.push(descriptor),
                    None => {
                        let name = applied
                            .iter()
                            .find(|r| r.id == *id)
                            .map(|r| r.name.clone())
                            .unwrap_or_default();
                        return Err(PlanningError::UnknownDescriptor {
                            id: id.clone(),
                            name,
                        }
                        .into());
                    }
                }
            }

            info!("Rolling back batch {}", batch.number);
            for (index, descriptor) in descriptors.iter().enumerate() {
                if cancel.is_cancelled() {
                    let remaining = descriptors.len() - index;
                    warn!(
                        "Cancelled rollback of batch {} with {} descriptor(s) left",
                        batch.number, remaining
                    );
                    return Err(MigrationError::Cancelled { remaining });
                }
                info!("Reverting {} ({})", descriptor.id(), descriptor.name());
                let prefixed = descriptor.with_prefix(&self.config.table_prefix);
                self.run_session(descriptor, &prefixed, None, Direction::Reverse)
                    .await?;
                report.reverted.push(descriptor.id().to_string());
            }

            // Each revert removed its own record; this only sweeps leftovers.
            let leftover = self
                .backend
                .remove_batch(batch.number)
                .await
                .map_err(MigrationError::from_backend)?;
            if leftover > 0 {
                warn!("Removed {} leftover record(s) of batch {}", leftover, batch.number);
            }
            info!("Rolled back batch {}", batch.number);
            report.batches.push(batch.number);
        }

        if report.batches.is_empty() {
            info!("Nothing to roll back");
        }
        Ok(report)
    }

    /// Ledger state of every known and recorded descriptor, ordered by id.
    pub async fn status(&self) -> Result<Vec<DescriptorStatus>, MigrationError> {
        let applied = self.read_ledger().await?;
        let mut statuses: Vec<DescriptorStatus> = self
            .descriptors
            .iter()
            .map(|descriptor| {
                let state = match applied.iter().find(|r| r.id == descriptor.id()) {
                    Some(record) => MigrationState::Applied {
                        batch: record.batch,
                        applied_at: record.applied_at,
                    },
                    None => MigrationState::Pending,
                };
                DescriptorStatus {
                    id: descriptor.id().to_string(),
                    name: descriptor.name().to_string(),
                    state,
                }
            })
            .collect();

        for record in planner::orphans(&self.descriptors, &applied) {
            statuses.push(DescriptorStatus {
                id: record.id.clone(),
                name: record.name.clone(),
                state: MigrationState::Orphaned {
                    batch: record.batch,
                    applied_at: record.applied_at,
                },
            });
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(statuses)
    }

    /// Pending descriptors in execution order.
    pub async fn pending(&self) -> Result<Vec<&Descriptor>, MigrationError> {
        let applied = self.read_ledger().await?;
        Ok(planner::plan(
            &self.descriptors,
            &applied,
            self.config.verify_checksums,
        )?)
    }

    /// The live schema, without the bookkeeping tables.
    pub async fn snapshot(&self) -> Result<SchemaSnapshot, MigrationError> {
        let tables = self.backend.ledger_tables();
        let snapshot = self
            .backend
            .snapshot()
            .await
            .map_err(MigrationError::from_backend)?;
        Ok(snapshot.without_tables([tables.ledger.as_str(), tables.lock.as_str()]))
    }

    /// Reads the ledger, treating a database that was never bootstrapped as
    /// having nothing applied.
    async fn read_ledger(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let exists = {
            let mut session = self
                .backend
                .begin()
                .await
                .map_err(MigrationError::from_backend)?;
            session
                .table_exists(&self.backend.ledger_tables().ledger)
                .await
                .map_err(MigrationError::from_backend)?
        };
        if !exists {
            return Ok(Vec::new());
        }
        self.backend
            .applied()
            .await
            .map_err(MigrationError::from_backend)
    }

    /// Applies or reverts `executable` in a session of its own. A forward
    /// run records `descriptor` in `batch` when given; a reverse run removes
    /// its record. The ledger change commits with the schema change.
    async fn run_session(
        &self,
        descriptor: &Descriptor,
        executable: &Descriptor,
        batch: Option<i64>,
        direction: Direction,
    ) -> Result<ExecutionSummary, MigrationError> {
        let fail = |operation: String, err: BackendError| {
            error!(
                "Descriptor {} ({}) failed at '{}': {}",
                descriptor.id(),
                descriptor.name(),
                operation,
                err
            );
            MigrationError::for_descriptor(descriptor.id(), descriptor.name(), operation, err)
        };

        let mut session = self
            .backend
            .begin()
            .await
            .map_err(|e| fail("begin session".to_string(), e))?;

        let executed = match direction {
            Direction::Forward => apply_forward(session.as_mut(), executable).await,
            Direction::Reverse => apply_reverse(session.as_mut(), executable).await,
        };
        let summary = executed.map_err(|e| fail(e.operation, e.source))?;

        match (direction, batch) {
            (Direction::Forward, Some(batch)) => session
                .record_applied(&MigrationRecord::new(descriptor, batch))
                .await
                .map_err(|e| fail("record ledger entry".to_string(), e))?,
            (Direction::Reverse, _) => session
                .remove_record(descriptor.id())
                .await
                .map_err(|e| fail("remove ledger entry".to_string(), e))?,
            (Direction::Forward, None) => {}
        }
        session
            .commit()
            .await
            .map_err(|e| fail("commit".to_string(), e))?;
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Releases `guard`, keeping the run's own error when both fail.
async fn release<T, B: Backend>(
    guard: LockGuard<'_, B>,
    result: Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    match (guard.release().await, result) {
        (Ok(()), result) => result,
        (Err(err), Ok(_)) => Err(MigrationError::from_backend(err)),
        (Err(err), Err(original)) => {
            error!("Failed to release migration lock: {}", err);
            Err(original)
        }
    }
}
