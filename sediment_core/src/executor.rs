//! Applies and reverts descriptors against a [`Session`].
//!
//! Every guarded operation is checked against the live schema before it
//! runs. An operation whose effect is already present is skipped, so a
//! descriptor that was partially applied by an earlier run can simply be
//! run again.

use crate::backend::{BackendError, Session};
use crate::descriptor::{Descriptor, Guard};
use crate::operation::Operation;
use crate::schema::TableDef;

/// A step of a descriptor failed.
#[derive(Debug, thiserror::Error)]
#[error("{operation}: {source}")]
pub struct ExecuteError {
    /// Description of the failing operation.
    pub operation: String,
    /// The underlying backend error.
    #[source]
    pub source: BackendError,
}

/// Counts of what happened to a descriptor's operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Operations that changed the schema.
    pub executed: usize,
    /// Operations skipped because the schema was already in the desired
    /// state.
    pub skipped: usize,
}

impl ExecutionSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Executed => self.executed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Executed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// What the live schema says about an operation.
#[derive(Debug, PartialEq, Eq)]
enum Precheck {
    /// The effect is already present.
    Satisfied,
    /// The operation can run.
    Run,
    /// Something the operation needs is absent.
    Missing(String),
    /// The schema contradicts the operation.
    Conflict(String),
}

/// Runs the forward steps of `descriptor` in order.
pub async fn apply_forward(
    session: &mut dyn Session,
    descriptor: &Descriptor,
) -> Result<ExecutionSummary, ExecuteError> {
    let mut summary = ExecutionSummary::default();
    for step in descriptor.forward() {
        let result = match step.guard {
            Guard::Guarded => run_guarded(session, &step.operation, Direction::Forward).await,
            Guard::Always => run_always(session, &step.operation).await,
        };
        let outcome = result.map_err(|source| ExecuteError {
            operation: step.operation.describe(),
            source,
        })?;
        summary.record(outcome);
    }
    Ok(summary)
}

/// Runs the reverse operations of `descriptor` in order.
///
/// Reverting is best effort: an operation whose target no longer exists is
/// a no-op.
pub async fn apply_reverse(
    session: &mut dyn Session,
    descriptor: &Descriptor,
) -> Result<ExecutionSummary, ExecuteError> {
    let mut summary = ExecutionSummary::default();
    for operation in descriptor.reverse() {
        let outcome = run_guarded(session, operation, Direction::Reverse)
            .await
            .map_err(|source| ExecuteError {
                operation: operation.describe(),
                source,
            })?;
        summary.record(outcome);
    }
    Ok(summary)
}

async fn run_always(
    session: &mut dyn Session,
    operation: &Operation,
) -> Result<Outcome, BackendError> {
    if let Operation::RecreateTable {
        from,
        into,
        copy_rows,
        rename_to,
    } = operation
    {
        let target = rename_to.as_deref().unwrap_or(&into.name);
        return recreate_table(session, from, into, copy_rows, target, Direction::Forward).await;
    }
    session.execute(operation).await?;
    Ok(Outcome::Executed)
}

async fn run_guarded(
    session: &mut dyn Session,
    operation: &Operation,
    direction: Direction,
) -> Result<Outcome, BackendError> {
    if let Operation::RecreateTable {
        from,
        into,
        copy_rows,
        rename_to,
    } = operation
    {
        let target = rename_to.as_deref().unwrap_or(&into.name);
        return recreate_table(session, from, into, copy_rows, target, direction).await;
    }

    match precheck(session, operation).await? {
        Precheck::Run => {
            session.execute(operation).await?;
            Ok(Outcome::Executed)
        }
        Precheck::Satisfied => {
            log::debug!("Skipping '{}': already applied", operation.describe());
            Ok(Outcome::Skipped)
        }
        Precheck::Missing(reason) if direction == Direction::Reverse => {
            log::debug!("Skipping '{}': {}", operation.describe(), reason);
            Ok(Outcome::Skipped)
        }
        Precheck::Missing(reason) | Precheck::Conflict(reason) => {
            Err(BackendError::Conflict(reason))
        }
    }
}

async fn precheck(
    session: &mut dyn Session,
    operation: &Operation,
) -> Result<Precheck, BackendError> {
    let check = match operation {
        Operation::CreateTable(table) => {
            if session.table_exists(&table.name).await? {
                Precheck::Satisfied
            } else {
                Precheck::Run
            }
        }
        Operation::DropTable { table } => {
            if session.table_exists(table).await? {
                Precheck::Run
            } else {
                Precheck::Satisfied
            }
        }
        Operation::RenameTable { from, to } => {
            let source = session.table_exists(from).await?;
            let target = session.table_exists(to).await?;
            match (source, target) {
                (true, false) => Precheck::Run,
                (false, true) => Precheck::Satisfied,
                (true, true) => {
                    Precheck::Conflict(format!("cannot rename {from} to {to}: both tables exist"))
                }
                (false, false) => Precheck::Missing(format!("table {from} does not exist")),
            }
        }
        Operation::AddColumn { table, column } => {
            if !session.table_exists(table).await? {
                Precheck::Missing(format!("table {table} does not exist"))
            } else if session.column_exists(table, &column.name).await? {
                Precheck::Satisfied
            } else {
                Precheck::Run
            }
        }
        Operation::DropColumn { table, column } => {
            if session.column_exists(table, column).await? {
                Precheck::Run
            } else {
                Precheck::Satisfied
            }
        }
        Operation::RenameColumn { table, from, to } => {
            if !session.table_exists(table).await? {
                return Ok(Precheck::Missing(format!("table {table} does not exist")));
            }
            let source = session.column_exists(table, from).await?;
            let target = session.column_exists(table, to).await?;
            match (source, target) {
                (true, false) => Precheck::Run,
                (false, true) => Precheck::Satisfied,
                (true, true) => Precheck::Conflict(format!(
                    "cannot rename {table}.{from} to {to}: both columns exist"
                )),
                (false, false) => {
                    Precheck::Missing(format!("column {table}.{from} does not exist"))
                }
            }
        }
        Operation::AddIndex(index) => {
            if !session.table_exists(&index.table).await? {
                Precheck::Missing(format!("table {} does not exist", index.table))
            } else if session.index_exists(&index.table, &index.name).await? {
                Precheck::Satisfied
            } else {
                Precheck::Run
            }
        }
        Operation::DropIndex { table, name } => {
            if session.table_exists(table).await? && session.index_exists(table, name).await? {
                Precheck::Run
            } else {
                Precheck::Satisfied
            }
        }
        Operation::RecreateTable { .. } | Operation::Sql { .. } => Precheck::Run,
    };
    Ok(check)
}

/// Rebuilds `from` as `into`, picking up where an interrupted attempt left
/// off.
///
/// The staging table existing means creation already happened; rows are
/// only copied into an empty staging table.
async fn recreate_table(
    session: &mut dyn Session,
    from: &str,
    into: &TableDef,
    copy_rows: &str,
    target: &str,
    direction: Direction,
) -> Result<Outcome, BackendError> {
    let staging = into.name.as_str();
    let mut outcome = Outcome::Skipped;

    if session.table_exists(from).await? {
        if session.table_exists(staging).await? {
            log::info!("Resuming recreate of {from}: {staging} already exists");
        } else {
            session
                .execute(&Operation::CreateTable(into.clone()))
                .await?;
        }

        if session.row_count(staging).await? == 0 {
            session.copy_rows(from, staging, copy_rows).await?;
        } else {
            log::info!("Not copying rows of {from}: {staging} already holds rows");
        }

        session.execute(&Operation::drop_table(from)).await?;
        outcome = Outcome::Executed;
    } else if !session.table_exists(staging).await? {
        if session.table_exists(target).await? {
            log::debug!("Skipping recreate of {from}: {target} already in place");
            return Ok(Outcome::Skipped);
        }
        if direction == Direction::Reverse {
            log::debug!("Skipping recreate of {from}: neither {from} nor {staging} exists");
            return Ok(Outcome::Skipped);
        }
        return Err(BackendError::Conflict(format!(
            "cannot recreate {from}: neither {from} nor {staging} exists"
        )));
    }

    if staging != target {
        if session.table_exists(target).await? {
            return Err(BackendError::Conflict(format!(
                "cannot rename {staging} to {target}: {target} already exists"
            )));
        }
        session
            .execute(&Operation::rename_table(staging, target))
            .await?;
        outcome = Outcome::Executed;
    }

    Ok(outcome)
}
