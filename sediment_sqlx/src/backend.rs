//! The sqlx backend: pool, ledger and migration lock.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sediment_core::{
    Backend, BackendError, Ledger, LedgerTables, MigrationLock, MigrationRecord, SchemaSnapshot,
    Session, TableSnapshot,
};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use crate::session::{Conn, SqlxSession};
use crate::{Dialect, introspect};

/// Key of the single row in the lock table.
const LOCK_KEY: &str = "migration";

/// Errors raised by [`SqlxBackend`].
#[derive(Debug, thiserror::Error)]
pub enum SqlxBackendError {
    /// The driver reported an error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A ledger row could not be read back.
    #[error("Malformed ledger record {id}: {reason}")]
    MalformedRecord {
        /// Id of the record.
        id: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl From<SqlxBackendError> for BackendError {
    fn from(err: SqlxBackendError) -> Self {
        match err {
            SqlxBackendError::Database(
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed,
            ) => BackendError::Connection(Box::new(err)),
            other => BackendError::Query(Box::new(other)),
        }
    }
}

pub(crate) fn db_err(err: sqlx::Error) -> BackendError {
    SqlxBackendError::Database(err).into()
}

/// Comma separated placeholders for `n` parameters.
pub(crate) fn placeholders(dialect: Dialect, n: usize) -> String {
    (1..=n)
        .map(|i| dialect.placeholder(i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A database reached through sqlx's `Any` driver.
///
/// Sessions borrow a pooled connection for their whole lifetime. On SQLite
/// the pool holds exactly one connection, so an in-memory database
/// survives between sessions.
#[derive(Debug, Clone)]
pub struct SqlxBackend {
    pool: AnyPool,
    dialect: Dialect,
    tables: LedgerTables,
}

impl SqlxBackend {
    /// Connects to `url`, using `tables` for bookkeeping.
    pub async fn connect(url: &str, tables: LedgerTables) -> Result<Self, BackendError> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_url(url);
        let options = match dialect {
            Dialect::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            _ => AnyPoolOptions::new().max_connections(5),
        };
        let pool = options
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| BackendError::Connection(Box::new(e)))?;
        log::info!("Connected to {} database", dialect);
        Ok(Self::with_pool(pool, dialect, tables))
    }

    /// Wraps an existing pool.
    pub fn with_pool(pool: AnyPool, dialect: Dialect, tables: LedgerTables) -> Self {
        Self {
            pool,
            dialect,
            tables,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// The dialect statements are rendered in.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn record_from_row(row: &AnyRow) -> Result<MigrationRecord, SqlxBackendError> {
        let id: String = row.try_get("id")?;
        let applied_at: String = row.try_get("applied_at")?;
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| SqlxBackendError::MalformedRecord {
                id: id.clone(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(MigrationRecord {
            name: row.try_get("descriptor_name")?,
            batch: row.try_get("batch_number")?,
            checksum: row.try_get("checksum")?,
            applied_at,
            id,
        })
    }
}

#[async_trait]
impl Ledger for SqlxBackend {
    async fn applied(&self) -> Result<Vec<MigrationRecord>, BackendError> {
        let sql = format!(
            "SELECT id, descriptor_name, batch_number, applied_at, checksum FROM {} ORDER BY id",
            self.dialect.quote(&self.tables.ledger)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let records = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn remove_batch(&self, batch: i64) -> Result<u64, BackendError> {
        let sql = format!(
            "DELETE FROM {} WHERE batch_number = {}",
            self.dialect.quote(&self.tables.ledger),
            self.dialect.placeholder(1)
        );
        let result = sqlx::query(&sql)
            .bind(batch)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        log::debug!(
            "Removed {} ledger record(s) of batch {}",
            result.rows_affected(),
            batch
        );
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MigrationLock for SqlxBackend {
    async fn try_lock(&self, owner: &str, stale_after: Duration) -> Result<bool, BackendError> {
        let d = self.dialect;
        let table = d.quote(&self.tables.lock);
        let now = Utc::now().timestamp();
        let cutoff = now.saturating_sub(i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX));

        let expire = format!(
            "DELETE FROM {table} WHERE lock_key = {} AND acquired_at < {}",
            d.placeholder(1),
            d.placeholder(2)
        );
        let expired = sqlx::query(&expire)
            .bind(LOCK_KEY)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if expired.rows_affected() > 0 {
            log::warn!("Removed stale migration lock older than {:?}", stale_after);
        }

        let insert = format!(
            "INSERT INTO {table} (lock_key, owner, acquired_at) VALUES ({})",
            placeholders(d, 3)
        );
        let inserted = sqlx::query(&insert)
            .bind(LOCK_KEY)
            .bind(owner)
            .bind(now)
            .execute(&self.pool)
            .await;
        let Err(insert_err) = inserted else {
            return Ok(true);
        };

        // The insert loses on the primary key when the lock is held.
        let holder = format!(
            "SELECT owner FROM {table} WHERE lock_key = {}",
            d.placeholder(1)
        );
        let current: Option<String> = sqlx::query_scalar(&holder)
            .bind(LOCK_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match current {
            Some(current) if current == owner => self.renew(owner).await,
            Some(current) => {
                log::debug!("Migration lock is held by {}", current);
                Ok(false)
            }
            None => Err(db_err(insert_err)),
        }
    }

    async fn renew(&self, owner: &str) -> Result<bool, BackendError> {
        let d = self.dialect;
        let sql = format!(
            "UPDATE {} SET acquired_at = {} WHERE lock_key = {} AND owner = {}",
            d.quote(&self.tables.lock),
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now().timestamp())
            .bind(LOCK_KEY)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // MySQL counts only changed rows, so a renewal within the same
        // second reports nothing affected.
        let holder = format!(
            "SELECT owner FROM {} WHERE lock_key = {}",
            d.quote(&self.tables.lock),
            d.placeholder(1)
        );
        let current: Option<String> = sqlx::query_scalar(&holder)
            .bind(LOCK_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(current.as_deref() == Some(owner))
    }

    async fn unlock(&self, owner: &str) -> Result<(), BackendError> {
        let d = self.dialect;
        let sql = format!(
            "DELETE FROM {} WHERE lock_key = {} AND owner = {}",
            d.quote(&self.tables.lock),
            d.placeholder(1),
            d.placeholder(2)
        );
        sqlx::query(&sql)
            .bind(LOCK_KEY)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqlxBackend {
    fn ledger_tables(&self) -> &LedgerTables {
        &self.tables
    }

    fn transactional_ddl(&self) -> bool {
        self.dialect.transactional_ddl()
    }

    async fn begin(&self) -> Result<Box<dyn Session + '_>, BackendError> {
        let conn = if self.transactional_ddl() {
            Conn::Tx(self.pool.begin().await.map_err(db_err)?)
        } else {
            Conn::Direct(self.pool.acquire().await.map_err(db_err)?)
        };
        Ok(Box::new(SqlxSession::new(
            conn,
            self.dialect,
            self.tables.clone(),
        )))
    }

    async fn snapshot(&self) -> Result<SchemaSnapshot, BackendError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let mut tables = BTreeMap::new();
        for table in introspect::tables(&mut conn, self.dialect)
            .await
            .map_err(db_err)?
        {
            let columns = introspect::columns(&mut conn, self.dialect, &table)
                .await
                .map_err(db_err)?;
            let indexes = introspect::indexes(&mut conn, self.dialect, &table)
                .await
                .map_err(db_err)?;
            tables.insert(
                table,
                TableSnapshot {
                    columns: columns.into_iter().collect(),
                    indexes: indexes.into_iter().collect(),
                },
            );
        }
        Ok(SchemaSnapshot { tables })
    }
}
