//! Sessions over the in-memory backend.

use async_trait::async_trait;
use sediment_core::{BackendError, Introspector, MigrationRecord, Operation, Session};
use tokio::sync::OwnedMutexGuard;

use crate::InMemoryBackend;
use crate::state::Schema;

/// A session against an [`InMemoryBackend`].
///
/// Transactional sessions work on a private copy of the schema and ledger
/// and publish it on commit; dropping one discards its work. Otherwise
/// every statement is applied to the shared state as it runs.
///
/// Only one session is open at a time.
pub struct InMemorySession {
    backend: InMemoryBackend,
    working: Option<Schema>,
    _guard: OwnedMutexGuard<()>,
}

impl InMemorySession {
    pub(crate) fn new(
        backend: InMemoryBackend,
        working: Option<Schema>,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            backend,
            working,
            _guard: guard,
        }
    }

    async fn read<R>(&mut self, f: impl FnOnce(&Schema) -> R) -> R {
        match &self.working {
            Some(schema) => f(schema),
            None => f(&self.backend.state.lock().await.schema),
        }
    }

    async fn write<R>(&mut self, f: impl FnOnce(&mut Schema) -> R) -> R {
        match &mut self.working {
            Some(schema) => f(schema),
            None => f(&mut self.backend.state.lock().await.schema),
        }
    }
}

#[async_trait]
impl Introspector for InMemorySession {
    async fn table_exists(&mut self, table: &str) -> Result<bool, BackendError> {
        Ok(self.read(|schema| schema.table_exists(table)).await)
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, BackendError> {
        Ok(self.read(|schema| schema.column_exists(table, column)).await)
    }

    async fn index_exists(&mut self, table: &str, index: &str) -> Result<bool, BackendError> {
        Ok(self.read(|schema| schema.index_exists(table, index)).await)
    }

    async fn row_count(&mut self, table: &str) -> Result<u64, BackendError> {
        let rows = self.read(|schema| schema.table(table).map(|t| t.rows)).await?;
        Ok(rows)
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn execute(&mut self, operation: &Operation) -> Result<(), BackendError> {
        self.backend.check_failure(operation).await?;
        self.backend.check_delay(operation).await;
        log::debug!("Executing '{}'", operation.describe());
        if let Operation::Sql { sql } = operation {
            self.backend.state.lock().await.executed_sql.push(sql.clone());
        }
        self.write(|schema| schema.apply(operation)).await?;
        Ok(())
    }

    async fn copy_rows(
        &mut self,
        from: &str,
        into: &str,
        statement: &str,
    ) -> Result<(), BackendError> {
        log::debug!("Copying rows of {} into {}: {}", from, into, statement);
        self.write(|schema| schema.copy_rows(from, into)).await?;
        Ok(())
    }

    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<(), BackendError> {
        let ledger = self.backend.tables.ledger.clone();
        self.write(|schema| schema.record(&ledger, record)).await?;
        Ok(())
    }

    async fn remove_record(&mut self, id: &str) -> Result<(), BackendError> {
        let ledger = self.backend.tables.ledger.clone();
        self.write(|schema| schema.unrecord(&ledger, id)).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        let mut session = *self;
        if let Some(schema) = session.working.take() {
            session.backend.state.lock().await.schema = schema;
        }
        Ok(())
    }
}
