use std::io::Write;

use anyhow::Result;
use sediment_core::{
    Backend, CancellationToken, MigrateOptions, MigrationError, MigrationState, Migrator,
};

pub(crate) async fn migrate<B: Backend, W: Write>(
    migrator: &Migrator<B>,
    step: bool,
    dry_run: bool,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let options = MigrateOptions { step, dry_run };
    let report = match migrator.migrate_with(options, cancel).await {
        Ok(report) => report,
        Err(err) => {
            report_failure(&err);
            return Err(err.into());
        }
    };

    if report.is_noop() {
        writeln!(out, "Nothing to migrate")?;
    } else if report.dry_run {
        for id in &report.planned {
            writeln!(out, "Would apply {}", describe(migrator, id))?;
        }
    } else {
        for id in &report.applied {
            writeln!(out, "Applied {}", describe(migrator, id))?;
        }
        let batches: Vec<String> = report.batches.iter().map(i64::to_string).collect();
        writeln!(
            out,
            "{} descriptor(s) applied in batch {}",
            report.applied.len(),
            batches.join(", ")
        )?;
    }
    Ok(())
}

pub(crate) async fn rollback<B: Backend, W: Write>(
    migrator: &Migrator<B>,
    batches: Option<usize>,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<()> {
    let result = match batches {
        Some(batches) => migrator.rollback(batches, cancel).await,
        None => migrator.reset(cancel).await,
    };
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            report_failure(&err);
            return Err(err.into());
        }
    };

    if report.batches.is_empty() {
        writeln!(out, "Nothing to roll back")?;
        return Ok(());
    }
    for id in &report.reverted {
        writeln!(out, "Reverted {}", describe(migrator, id))?;
    }
    let batches: Vec<String> = report.batches.iter().map(i64::to_string).collect();
    writeln!(out, "Rolled back batch {}", batches.join(", "))?;
    Ok(())
}

pub(crate) async fn status<B: Backend, W: Write>(migrator: &Migrator<B>, out: &mut W) -> Result<()> {
    for status in migrator.status().await? {
        let state = match status.state {
            MigrationState::Applied { batch, applied_at } => {
                format!("applied   batch {batch} at {}", applied_at.to_rfc3339())
            }
            MigrationState::Pending => "pending".to_string(),
            MigrationState::Orphaned { batch, applied_at } => format!(
                "orphaned  batch {batch} at {} (no descriptor file)",
                applied_at.to_rfc3339()
            ),
        };
        writeln!(out, "{:<20} {:<45} {}", status.id, status.name, state)?;
    }
    Ok(())
}

pub(crate) async fn schema<B: Backend, W: Write>(migrator: &Migrator<B>, out: &mut W) -> Result<()> {
    let snapshot = migrator.snapshot().await?;
    serde_json::to_writer_pretty(&mut *out, &snapshot)?;
    writeln!(out)?;
    Ok(())
}

fn describe<B: Backend>(migrator: &Migrator<B>, id: &str) -> String {
    match migrator.descriptors().iter().find(|d| d.id() == id) {
        Some(descriptor) => format!("{} ({})", id, descriptor.name()),
        None => id.to_string(),
    }
}

fn report_failure(err: &MigrationError) {
    match err {
        MigrationError::Operation { id, name, .. } => {
            log::error!("Descriptor {} ({}) failed: {}", id, name, err);
        }
        MigrationError::LockContention { .. } => {
            log::error!("{}; try again once the other runner is done", err);
        }
        MigrationError::Cancelled { .. } => log::warn!("{}", err),
        _ => log::error!("{}", err),
    }
}
