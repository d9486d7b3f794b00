//! Sessions over a pooled connection.

use async_trait::async_trait;
use sediment_core::{BackendError, Introspector, LedgerTables, MigrationRecord, Operation, Session};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, Transaction};

use crate::backend::{db_err, placeholders};
use crate::{Dialect, ddl, introspect};

pub(crate) enum Conn {
    Tx(Transaction<'static, Any>),
    Direct(PoolConnection<Any>),
}

/// A session of a [`SqlxBackend`](crate::SqlxBackend).
///
/// On dialects with transactional DDL the session is a transaction that
/// rolls back when dropped uncommitted. On MySQL it is a plain connection.
pub struct SqlxSession {
    conn: Conn,
    dialect: Dialect,
    tables: LedgerTables,
}

impl SqlxSession {
    pub(crate) fn new(conn: Conn, dialect: Dialect, tables: LedgerTables) -> Self {
        Self {
            conn,
            dialect,
            tables,
        }
    }

    fn conn(&mut self) -> &mut AnyConnection {
        match &mut self.conn {
            Conn::Tx(tx) => &mut **tx,
            Conn::Direct(conn) => &mut **conn,
        }
    }

    /// Moves the sequences behind `table`'s generated columns past the rows
    /// copied in with explicit values.
    async fn reset_sequences(&mut self, table: &str) -> Result<(), BackendError> {
        let dialect = self.dialect;
        let columns = introspect::generated_columns(self.conn(), dialect, table)
            .await
            .map_err(db_err)?;
        for column in columns {
            let sql = ddl::sequence_reset(dialect, table, &column);
            log::debug!("Resetting sequence of {}.{}", table, column);
            sqlx::query(&sql)
                .bind(dialect.quote(table))
                .bind(column.as_str())
                .execute(self.conn())
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn run(&mut self, sql: &str) -> Result<(), BackendError> {
        sqlx::Executor::execute(self.conn(), sqlx::raw_sql(sql))
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Introspector for SqlxSession {
    async fn table_exists(&mut self, table: &str) -> Result<bool, BackendError> {
        let dialect = self.dialect;
        introspect::table_exists(self.conn(), dialect, table)
            .await
            .map_err(db_err)
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, BackendError> {
        let dialect = self.dialect;
        introspect::column_exists(self.conn(), dialect, table, column)
            .await
            .map_err(db_err)
    }

    async fn index_exists(&mut self, table: &str, index: &str) -> Result<bool, BackendError> {
        let dialect = self.dialect;
        introspect::index_exists(self.conn(), dialect, table, index)
            .await
            .map_err(db_err)
    }

    async fn row_count(&mut self, table: &str) -> Result<u64, BackendError> {
        let dialect = self.dialect;
        introspect::row_count(self.conn(), dialect, table)
            .await
            .map_err(db_err)
    }
}

#[async_trait]
impl Session for SqlxSession {
    async fn execute(&mut self, operation: &Operation) -> Result<(), BackendError> {
        let sql = ddl::render(self.dialect, operation)?;
        log::debug!("Executing '{}': {}", operation.describe(), sql);
        self.run(&sql).await
    }

    async fn copy_rows(
        &mut self,
        from: &str,
        into: &str,
        statement: &str,
    ) -> Result<(), BackendError> {
        log::debug!("Copying rows of {} into {}: {}", from, into, statement);
        self.run(statement).await?;
        if self.dialect == Dialect::Postgres {
            self.reset_sequences(into).await?;
        }
        Ok(())
    }

    async fn remove_record(&mut self, id: &str) -> Result<(), BackendError> {
        let sql = format!(
            "DELETE FROM {} WHERE id = {}",
            self.dialect.quote(&self.tables.ledger),
            self.dialect.placeholder(1)
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(self.conn())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_applied(&mut self, record: &MigrationRecord) -> Result<(), BackendError> {
        let sql = format!(
            "INSERT INTO {} (id, descriptor_name, batch_number, applied_at, checksum) VALUES ({})",
            self.dialect.quote(&self.tables.ledger),
            placeholders(self.dialect, 5)
        );
        sqlx::query(&sql)
            .bind(record.id.as_str())
            .bind(record.name.as_str())
            .bind(record.batch)
            .bind(record.applied_at.to_rfc3339())
            .bind(record.checksum.as_str())
            .execute(self.conn())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        match self.conn {
            Conn::Tx(tx) => tx.commit().await.map_err(db_err),
            Conn::Direct(_) => Ok(()),
        }
    }
}
