//! The in-memory schema model.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sediment_core::{
    BackendError, MigrationRecord, Operation, SchemaSnapshot, TableDef, TableSnapshot,
};

/// Errors raised by the in-memory backend, reported as
/// [`BackendError::Query`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryBackendError {
    /// The table does not exist.
    #[error("no such table: {0}")]
    NoSuchTable(String),
    /// The table already exists.
    #[error("table {0} already exists")]
    TableExists(String),
    /// The column does not exist.
    #[error("no such column: {0}.{1}")]
    NoSuchColumn(String, String),
    /// The column already exists.
    #[error("duplicate column name: {0}.{1}")]
    ColumnExists(String, String),
    /// The index does not exist.
    #[error("no such index: {0}")]
    NoSuchIndex(String),
    /// The index already exists.
    #[error("index {0} already exists")]
    IndexExists(String),
    /// A ledger row with this id exists.
    #[error("ledger already holds {0}")]
    DuplicateRecord(String),
    /// The operation cannot be expressed by this backend.
    #[error("the in-memory backend cannot run '{0}' as a single statement")]
    Unsupported(String),
    /// A failure injected by a test.
    #[error("injected failure at '{0}'")]
    Injected(String),
}

impl From<InMemoryBackendError> for BackendError {
    fn from(err: InMemoryBackendError) -> Self {
        match err {
            InMemoryBackendError::Unsupported(what) => BackendError::Unsupported(what),
            other => BackendError::Query(Box::new(other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemTable {
    pub(crate) columns: Vec<String>,
    /// Index name to indexed columns.
    pub(crate) indexes: BTreeMap<String, Vec<String>>,
    pub(crate) rows: u64,
}

impl MemTable {
    fn from_def(table: &TableDef) -> Self {
        Self {
            columns: table.column_names().map(str::to_string).collect(),
            indexes: BTreeMap::new(),
            rows: 0,
        }
    }

    pub(crate) fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Everything a transactional session copies and publishes on commit.
#[derive(Debug, Clone, Default)]
pub(crate) struct Schema {
    pub(crate) tables: BTreeMap<String, MemTable>,
    pub(crate) ledger: BTreeMap<String, MigrationRecord>,
}

#[derive(Debug, Clone)]
pub(crate) struct LockRow {
    pub(crate) owner: String,
    pub(crate) acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct MemState {
    pub(crate) schema: Schema,
    pub(crate) lock: Option<LockRow>,
    pub(crate) executed_sql: Vec<String>,
}

impl Schema {
    pub(crate) fn table(&self, name: &str) -> Result<&MemTable, InMemoryBackendError> {
        self.tables
            .get(name)
            .ok_or_else(|| InMemoryBackendError::NoSuchTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, InMemoryBackendError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| InMemoryBackendError::NoSuchTable(name.to_string()))
    }

    fn index_name_taken(&self, index: &str) -> bool {
        self.tables.values().any(|t| t.indexes.contains_key(index))
    }

    pub(crate) fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub(crate) fn column_exists(&self, table: &str, column: &str) -> bool {
        self.tables.get(table).is_some_and(|t| t.has_column(column))
    }

    pub(crate) fn index_exists(&self, table: &str, index: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.indexes.contains_key(index))
    }

    /// Applies `operation` like a database would: without any guard.
    pub(crate) fn apply(&mut self, operation: &Operation) -> Result<(), InMemoryBackendError> {
        match operation {
            Operation::CreateTable(table) => {
                if self.table_exists(&table.name) {
                    return Err(InMemoryBackendError::TableExists(table.name.clone()));
                }
                let mut created = MemTable::from_def(table);
                // Unique columns get an implicit index, as on SQLite
                for (position, column) in table.columns.iter().filter(|c| c.unique).enumerate() {
                    created.indexes.insert(
                        format!("autoindex_{}_{}", table.name, position + 1),
                        vec![column.name.clone()],
                    );
                }
                self.tables.insert(table.name.clone(), created);
            }
            Operation::DropTable { table } => {
                self.tables
                    .remove(table)
                    .ok_or_else(|| InMemoryBackendError::NoSuchTable(table.clone()))?;
            }
            Operation::RenameTable { from, to } => {
                if self.table_exists(to) {
                    return Err(InMemoryBackendError::TableExists(to.clone()));
                }
                let table = self
                    .tables
                    .remove(from)
                    .ok_or_else(|| InMemoryBackendError::NoSuchTable(from.clone()))?;
                self.tables.insert(to.clone(), table);
            }
            Operation::AddColumn { table, column } => {
                let target = self.table_mut(table)?;
                if target.has_column(&column.name) {
                    return Err(InMemoryBackendError::ColumnExists(
                        table.clone(),
                        column.name.clone(),
                    ));
                }
                target.columns.push(column.name.clone());
            }
            Operation::DropColumn { table, column } => {
                let target = self.table_mut(table)?;
                if !target.has_column(column) {
                    return Err(InMemoryBackendError::NoSuchColumn(
                        table.clone(),
                        column.clone(),
                    ));
                }
                target.columns.retain(|c| c != column);
                target.indexes.retain(|_, columns| !columns.contains(column));
            }
            Operation::RenameColumn { table, from, to } => {
                let target = self.table_mut(table)?;
                if target.has_column(to) {
                    return Err(InMemoryBackendError::ColumnExists(table.clone(), to.clone()));
                }
                let Some(position) = target.columns.iter().position(|c| c == from) else {
                    return Err(InMemoryBackendError::NoSuchColumn(
                        table.clone(),
                        from.clone(),
                    ));
                };
                target.columns[position] = to.clone();
                for columns in target.indexes.values_mut() {
                    for column in columns.iter_mut().filter(|c| c.as_str() == from.as_str()) {
                        *column = to.clone();
                    }
                }
            }
            Operation::AddIndex(index) => {
                if self.index_name_taken(&index.name) {
                    return Err(InMemoryBackendError::IndexExists(index.name.clone()));
                }
                let target = self.table_mut(&index.table)?;
                if let Some(missing) = index.columns.iter().find(|c| !target.has_column(c)) {
                    return Err(InMemoryBackendError::NoSuchColumn(
                        index.table.clone(),
                        missing.clone(),
                    ));
                }
                target
                    .indexes
                    .insert(index.name.clone(), index.columns.clone());
            }
            Operation::DropIndex { table, name } => {
                let target = self.table_mut(table)?;
                target
                    .indexes
                    .remove(name)
                    .ok_or_else(|| InMemoryBackendError::NoSuchIndex(name.clone()))?;
            }
            Operation::RecreateTable { .. } => {
                return Err(InMemoryBackendError::Unsupported(operation.describe()));
            }
            // Raw SQL is opaque; callers record it.
            Operation::Sql { .. } => {}
        }
        Ok(())
    }

    pub(crate) fn copy_rows(&mut self, from: &str, into: &str) -> Result<(), InMemoryBackendError> {
        let rows = self.table(from)?.rows;
        self.table_mut(into)?.rows += rows;
        Ok(())
    }

    pub(crate) fn insert_rows(&mut self, table: &str, rows: u64) -> Result<(), InMemoryBackendError> {
        self.table_mut(table)?.rows += rows;
        Ok(())
    }

    pub(crate) fn record(
        &mut self,
        ledger_table: &str,
        record: &MigrationRecord,
    ) -> Result<(), InMemoryBackendError> {
        if self.ledger.contains_key(&record.id) {
            return Err(InMemoryBackendError::DuplicateRecord(record.id.clone()));
        }
        self.table_mut(ledger_table)?.rows += 1;
        self.ledger.insert(record.id.clone(), record.clone());
        Ok(())
    }

    pub(crate) fn unrecord(&mut self, ledger_table: &str, id: &str) -> Result<(), InMemoryBackendError> {
        self.table(ledger_table)?;
        if self.ledger.remove(id).is_some() {
            let table = self.table_mut(ledger_table)?;
            table.rows = table.rows.saturating_sub(1);
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> SchemaSnapshot {
        let tables = self
            .tables
            .iter()
            .map(|(name, table)| {
                let snapshot = TableSnapshot {
                    columns: table.columns.iter().cloned().collect::<BTreeSet<_>>(),
                    indexes: table.indexes.keys().cloned().collect::<BTreeSet<_>>(),
                };
                (name.clone(), snapshot)
            })
            .collect();
        SchemaSnapshot { tables }
    }
}
