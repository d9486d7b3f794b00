//! Schema change operations.
//!
//! An [`Operation`] is a plain value describing one schema change. Whether it
//! runs is decided by the executor, which checks the live schema first so
//! every operation can be re-applied safely.

use serde::{Deserialize, Serialize};

use crate::schema::{ColumnDef, IndexDef, TableDef};

/// Token replaced by the configured table prefix inside raw SQL.
pub const PREFIX_TOKEN: &str = "{prefix}";

/// A single schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Creates a table.
    CreateTable(TableDef),
    /// Drops a table.
    DropTable {
        /// Table to drop.
        table: String,
    },
    /// Renames a table.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Adds a column to an existing table.
    AddColumn {
        /// Target table.
        table: String,
        /// Column to add.
        column: ColumnDef,
    },
    /// Drops a column.
    DropColumn {
        /// Target table.
        table: String,
        /// Column to drop.
        column: String,
    },
    /// Renames a column.
    RenameColumn {
        /// Target table.
        table: String,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Creates an index.
    AddIndex(IndexDef),
    /// Drops an index.
    DropIndex {
        /// Indexed table.
        table: String,
        /// Index name.
        name: String,
    },
    /// Rebuilds a table under a new definition: create `into`, copy the rows
    /// of `from` with `copy_rows`, drop `from`, then rename `into` to
    /// `rename_to` when given.
    ///
    /// Used where an engine cannot alter a table in place, e.g. adding a
    /// foreign key on SQLite.
    RecreateTable {
        /// Table being replaced.
        from: String,
        /// Definition of the replacement table (its staging name).
        into: TableDef,
        /// Statement copying rows from `from` into `into.name`.
        copy_rows: String,
        /// Final name of the replacement table.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rename_to: Option<String>,
    },
    /// Raw SQL. Cannot be introspected, so it always runs.
    Sql {
        /// The statement(s) to execute.
        sql: String,
    },
}

impl Operation {
    /// Shorthand for [`Operation::CreateTable`].
    pub fn create_table(table: TableDef) -> Self {
        Operation::CreateTable(table)
    }

    /// Shorthand for [`Operation::DropTable`].
    pub fn drop_table(table: impl Into<String>) -> Self {
        Operation::DropTable {
            table: table.into(),
        }
    }

    /// Shorthand for [`Operation::RenameTable`].
    pub fn rename_table(from: impl Into<String>, to: impl Into<String>) -> Self {
        Operation::RenameTable {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Shorthand for [`Operation::AddColumn`].
    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        Operation::AddColumn {
            table: table.into(),
            column,
        }
    }

    /// Shorthand for [`Operation::DropColumn`].
    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Operation::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Shorthand for [`Operation::RenameColumn`].
    pub fn rename_column(
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Operation::RenameColumn {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Shorthand for [`Operation::AddIndex`].
    pub fn add_index(index: IndexDef) -> Self {
        Operation::AddIndex(index)
    }

    /// Shorthand for [`Operation::DropIndex`].
    pub fn drop_index(table: impl Into<String>, name: impl Into<String>) -> Self {
        Operation::DropIndex {
            table: table.into(),
            name: name.into(),
        }
    }

    /// Shorthand for [`Operation::RecreateTable`].
    pub fn recreate_table(
        from: impl Into<String>,
        into: TableDef,
        copy_rows: impl Into<String>,
        rename_to: Option<String>,
    ) -> Self {
        Operation::RecreateTable {
            from: from.into(),
            into,
            copy_rows: copy_rows.into(),
            rename_to,
        }
    }

    /// Shorthand for [`Operation::Sql`].
    pub fn sql(sql: impl Into<String>) -> Self {
        Operation::Sql { sql: sql.into() }
    }

    /// One line, human readable description.
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateTable(table) => format!("create table {}", table.name),
            Operation::DropTable { table } => format!("drop table {table}"),
            Operation::RenameTable { from, to } => format!("rename table {from} to {to}"),
            Operation::AddColumn { table, column } => {
                format!("add column {}.{}", table, column.name)
            }
            Operation::DropColumn { table, column } => format!("drop column {table}.{column}"),
            Operation::RenameColumn { table, from, to } => {
                format!("rename column {table}.{from} to {to}")
            }
            Operation::AddIndex(index) => format!("add index {} on {}", index.name, index.table),
            Operation::DropIndex { table, name } => format!("drop index {name} on {table}"),
            Operation::RecreateTable {
                from,
                into,
                rename_to,
                ..
            } => match rename_to {
                Some(rename_to) => format!("recreate table {from} as {rename_to} (via {})", into.name),
                None => format!("recreate table {from} as {}", into.name),
            },
            Operation::Sql { sql } => {
                let first_line = sql.trim().lines().next().unwrap_or_default();
                format!("sql: {first_line}")
            }
        }
    }

    /// The operation undoing this one, if it can be derived from the
    /// operation alone.
    ///
    /// Drops lose the definition of what they remove, raw SQL is opaque and a
    /// recreated table cannot be split back, so those return `None`.
    pub fn inverse(&self) -> Option<Operation> {
        match self {
            Operation::CreateTable(table) => Some(Operation::drop_table(table.name.clone())),
            Operation::RenameTable { from, to } => {
                Some(Operation::rename_table(to.clone(), from.clone()))
            }
            Operation::AddColumn { table, column } => {
                Some(Operation::drop_column(table.clone(), column.name.clone()))
            }
            Operation::RenameColumn { table, from, to } => Some(Operation::rename_column(
                table.clone(),
                to.clone(),
                from.clone(),
            )),
            Operation::AddIndex(index) => Some(Operation::drop_index(
                index.table.clone(),
                index.name.clone(),
            )),
            Operation::DropTable { .. }
            | Operation::DropColumn { .. }
            | Operation::DropIndex { .. }
            | Operation::RecreateTable { .. }
            | Operation::Sql { .. } => None,
        }
    }

    /// The same operation with every table and index name prefixed, and the
    /// [`PREFIX_TOKEN`] substituted in raw SQL.
    pub fn with_prefix(&self, prefix: &str) -> Operation {
        let p = |name: &str| format!("{prefix}{name}");
        match self {
            Operation::CreateTable(table) => Operation::CreateTable(prefix_table(table, prefix)),
            Operation::DropTable { table } => Operation::DropTable { table: p(table) },
            Operation::RenameTable { from, to } => Operation::RenameTable {
                from: p(from),
                to: p(to),
            },
            Operation::AddColumn { table, column } => Operation::AddColumn {
                table: p(table),
                column: column.clone(),
            },
            Operation::DropColumn { table, column } => Operation::DropColumn {
                table: p(table),
                column: column.clone(),
            },
            Operation::RenameColumn { table, from, to } => Operation::RenameColumn {
                table: p(table),
                from: from.clone(),
                to: to.clone(),
            },
            Operation::AddIndex(index) => Operation::AddIndex(IndexDef {
                name: p(&index.name),
                table: p(&index.table),
                columns: index.columns.clone(),
                unique: index.unique,
            }),
            Operation::DropIndex { table, name } => Operation::DropIndex {
                table: p(table),
                name: p(name),
            },
            Operation::RecreateTable {
                from,
                into,
                copy_rows,
                rename_to,
            } => Operation::RecreateTable {
                from: p(from),
                into: prefix_table(into, prefix),
                copy_rows: substitute_prefix(copy_rows, prefix),
                rename_to: rename_to.as_deref().map(p),
            },
            Operation::Sql { sql } => Operation::Sql {
                sql: substitute_prefix(sql, prefix),
            },
        }
    }
}

fn prefix_table(table: &TableDef, prefix: &str) -> TableDef {
    let mut table = table.clone();
    table.name = format!("{prefix}{}", table.name);
    for foreign_key in &mut table.foreign_keys {
        foreign_key.references = format!("{prefix}{}", foreign_key.references);
    }
    table
}

/// Replaces [`PREFIX_TOKEN`] with `prefix`.
pub fn substitute_prefix(sql: &str, prefix: &str) -> String {
    sql.replace(PREFIX_TOKEN, prefix)
}
