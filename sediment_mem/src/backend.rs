//! The in-memory backend: schema, ledger and lock behind one mutex.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sediment_core::{
    Backend, BackendError, Ledger, LedgerTables, MigrationLock, MigrationRecord, Operation,
    SchemaSnapshot, Session,
};
use tokio::sync::Mutex;

use crate::session::InMemorySession;
use crate::state::{InMemoryBackendError, LockRow, MemState};

type FailurePredicate = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;
type Delay = (FailurePredicate, Duration);

/// An in-memory database.
///
/// Clones share the same state, so two migrators built from clones of one
/// backend behave like two runners against one database.
#[derive(Clone)]
pub struct InMemoryBackend {
    pub(crate) state: Arc<Mutex<MemState>>,
    /// Held by every open session: one session at a time.
    pub(crate) sessions: Arc<Mutex<()>>,
    failure: Arc<Mutex<Option<FailurePredicate>>>,
    delay: Arc<Mutex<Option<Delay>>>,
    pub(crate) tables: LedgerTables,
    transactional: bool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(LedgerTables::default())
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("tables", &self.tables)
            .field("transactional", &self.transactional)
            .finish()
    }
}

impl InMemoryBackend {
    /// Creates an empty, transactional database using `tables` for
    /// bookkeeping.
    pub fn new(tables: LedgerTables) -> Self {
        log::debug!("Creating in-memory backend with ledger {}", tables.ledger);
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            sessions: Arc::new(Mutex::new(())),
            failure: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(None)),
            tables,
            transactional: true,
        }
    }

    /// Makes every statement take effect immediately, as on engines
    /// without transactional DDL.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Makes `execute` fail for every operation matching `predicate`.
    pub async fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        *self.failure.lock().await = Some(Arc::new(predicate));
    }

    /// Removes the failure set by [`InMemoryBackend::fail_when`].
    pub async fn clear_failures(&self) {
        *self.failure.lock().await = None;
    }

    pub(crate) async fn check_failure(&self, operation: &Operation) -> Result<(), BackendError> {
        let failure = self.failure.lock().await;
        match failure.as_ref() {
            Some(predicate) if predicate(operation) => {
                log::debug!("Injecting failure at '{}'", operation.describe());
                Err(InMemoryBackendError::Injected(operation.describe()).into())
            }
            _ => Ok(()),
        }
    }

    /// Makes `execute` take `duration` for every operation matching
    /// `predicate`, as a long table rewrite would.
    pub async fn slow_when<F>(&self, predicate: F, duration: Duration)
    where
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        *self.delay.lock().await = Some((Arc::new(predicate), duration));
    }

    pub(crate) async fn check_delay(&self, operation: &Operation) {
        let delay = match self.delay.lock().await.as_ref() {
            Some((predicate, duration)) if predicate(operation) => Some(*duration),
            _ => None,
        };
        if let Some(duration) = delay {
            log::debug!("Delaying '{}' by {:?}", operation.describe(), duration);
            tokio::time::sleep(duration).await;
        }
    }

    /// Applies `operation` directly, outside of any session or ledger, as
    /// an operator changing the schema by hand would.
    pub async fn run_out_of_band(&self, operation: &Operation) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.schema.apply(operation)?;
        Ok(())
    }

    /// Adds `rows` rows to `table`.
    pub async fn insert_rows(&self, table: &str, rows: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.schema.insert_rows(table, rows)?;
        Ok(())
    }

    /// Number of rows in `table`, if it exists.
    pub async fn rows(&self, table: &str) -> Option<u64> {
        let state = self.state.lock().await;
        state.schema.tables.get(table).map(|t| t.rows)
    }

    /// Places a lock row as if `owner` had taken the lock at `acquired_at`.
    pub async fn hold_lock(&self, owner: &str, acquired_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.lock = Some(LockRow {
            owner: owner.to_string(),
            acquired_at,
        });
    }

    /// Current holder of the migration lock.
    pub async fn lock_owner(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.lock.as_ref().map(|row| row.owner.clone())
    }

    /// Raw SQL statements submitted so far, in order.
    pub async fn executed_sql(&self) -> Vec<String> {
        self.state.lock().await.executed_sql.clone()
    }

    fn require_table(state: &MemState, table: &str) -> Result<(), BackendError> {
        if state.schema.table_exists(table) {
            Ok(())
        } else {
            Err(InMemoryBackendError::NoSuchTable(table.to_string()).into())
        }
    }
}

#[async_trait]
impl Ledger for InMemoryBackend {
    async fn applied(&self) -> Result<Vec<MigrationRecord>, BackendError> {
        let state = self.state.lock().await;
        Self::require_table(&state, &self.tables.ledger)?;
        Ok(state.schema.ledger.values().cloned().collect())
    }

    async fn remove_batch(&self, batch: i64) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        Self::require_table(&state, &self.tables.ledger)?;
        let before = state.schema.ledger.len();
        state.schema.ledger.retain(|_, record| record.batch != batch);
        let removed = (before - state.schema.ledger.len()) as u64;
        if let Some(table) = state.schema.tables.get_mut(&self.tables.ledger) {
            table.rows = table.rows.saturating_sub(removed);
        }
        log::debug!("Removed {} ledger record(s) of batch {}", removed, batch);
        Ok(removed)
    }
}

#[async_trait]
impl MigrationLock for InMemoryBackend {
    async fn try_lock(&self, owner: &str, stale_after: Duration) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        Self::require_table(&state, &self.tables.lock)?;
        let now = Utc::now();
        if let Some(row) = &state.lock {
            let stale = (now - row.acquired_at)
                .to_std()
                .is_ok_and(|age| age > stale_after);
            if row.owner != owner && !stale {
                return Ok(false);
            }
            if stale && row.owner != owner {
                log::warn!(
                    "Taking over stale migration lock held by {} since {}",
                    row.owner,
                    row.acquired_at
                );
            }
        }
        state.lock = Some(LockRow {
            owner: owner.to_string(),
            acquired_at: now,
        });
        Ok(true)
    }

    async fn renew(&self, owner: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        match state.lock.as_mut() {
            Some(row) if row.owner == owner => {
                row.acquired_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, owner: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.lock.as_ref().is_some_and(|row| row.owner == owner) {
            state.lock = None;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn ledger_tables(&self) -> &LedgerTables {
        &self.tables
    }

    fn transactional_ddl(&self) -> bool {
        self.transactional
    }

    async fn begin(&self) -> Result<Box<dyn Session + '_>, BackendError> {
        let guard = self.sessions.clone().lock_owned().await;
        let working = if self.transactional {
            Some(self.state.lock().await.schema.clone())
        } else {
            None
        };
        Ok(Box::new(InMemorySession::new(self.clone(), working, guard)))
    }

    async fn snapshot(&self) -> Result<SchemaSnapshot, BackendError> {
        Ok(self.state.lock().await.schema.snapshot())
    }
}
