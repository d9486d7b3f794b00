//! Rendering of [`Operation`]s as dialect specific DDL.

use sediment_core::{
    BackendError, ColumnDef, ColumnType, ForeignKey, IndexDef, Operation, TableDef,
};

use crate::Dialect;

/// Renders `operation` as a single SQL statement (or, for raw SQL, the
/// statements as written).
///
/// [`Operation::RecreateTable`] is decomposed by the executor and is
/// rejected here.
pub fn render(dialect: Dialect, operation: &Operation) -> Result<String, BackendError> {
    let q = |name: &str| dialect.quote(name);
    let sql = match operation {
        Operation::CreateTable(table) => create_table(dialect, table),
        Operation::DropTable { table } => format!("DROP TABLE {}", q(table)),
        Operation::RenameTable { from, to } => {
            format!("ALTER TABLE {} RENAME TO {}", q(from), q(to))
        }
        Operation::AddColumn { table, column } => format!(
            "ALTER TABLE {} ADD COLUMN {}",
            q(table),
            column_definition(dialect, column, true)
        ),
        Operation::DropColumn { table, column } => {
            format!("ALTER TABLE {} DROP COLUMN {}", q(table), q(column))
        }
        Operation::RenameColumn { table, from, to } => format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            q(table),
            q(from),
            q(to)
        ),
        Operation::AddIndex(index) => create_index(dialect, index),
        Operation::DropIndex { table, name } => match dialect {
            Dialect::MySql => format!("DROP INDEX {} ON {}", q(name), q(table)),
            _ => format!("DROP INDEX {}", q(name)),
        },
        Operation::RecreateTable { .. } => {
            return Err(BackendError::Unsupported(format!(
                "'{}' must be decomposed before execution",
                operation.describe()
            )));
        }
        Operation::Sql { sql } => sql.clone(),
    };
    Ok(sql)
}

/// `CREATE TABLE` for `table`, with its primary and foreign keys.
pub fn create_table(dialect: Dialect, table: &TableDef) -> String {
    let flagged: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.as_str())
        .collect();
    // A composite key, declared or implied by several flagged columns, is
    // rendered as a table constraint.
    let composite: Vec<&str> = if !table.primary_key.is_empty() {
        table.primary_key.iter().map(String::as_str).collect()
    } else if flagged.len() > 1 {
        flagged
    } else {
        Vec::new()
    };

    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| column_definition(dialect, c, composite.is_empty()))
        .collect();
    if !composite.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", column_list(dialect, &composite)));
    }
    parts.extend(table.foreign_keys.iter().map(|fk| foreign_key(dialect, fk)));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        dialect.quote(&table.name),
        parts.join(", ")
    )
}

fn create_index(dialect: Dialect, index: &IndexDef) -> String {
    let columns: Vec<&str> = index.columns.iter().map(String::as_str).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        dialect.quote(&index.name),
        dialect.quote(&index.table),
        column_list(dialect, &columns)
    )
}

fn foreign_key(dialect: Dialect, fk: &ForeignKey) -> String {
    let columns: Vec<&str> = fk.columns.iter().map(String::as_str).collect();
    let referenced: Vec<&str> = fk.referenced_columns.iter().map(String::as_str).collect();
    let mut sql = format!(
        "FOREIGN KEY ({}) REFERENCES {} ({})",
        column_list(dialect, &columns),
        dialect.quote(&fk.references),
        column_list(dialect, &referenced)
    );
    if let Some(action) = fk.on_delete {
        sql.push_str(" ON DELETE ");
        sql.push_str(action.as_sql());
    }
    if let Some(action) = fk.on_update {
        sql.push_str(" ON UPDATE ");
        sql.push_str(action.as_sql());
    }
    sql
}

fn column_list(dialect: Dialect, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| dialect.quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A column as it appears in `CREATE TABLE` or `ADD COLUMN`.
///
/// `inline_key` is false when the table declares a composite key, in which
/// case the column's own primary key flag is not rendered.
pub fn column_definition(dialect: Dialect, column: &ColumnDef, inline_key: bool) -> String {
    let primary_key = inline_key && column.primary_key;
    let mut sql = format!(
        "{} {}",
        dialect.quote(&column.name),
        column_type(dialect, column)
    );
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    if column.auto_increment {
        match dialect {
            Dialect::MySql => sql.push_str(" AUTO_INCREMENT"),
            Dialect::Other => sql.push_str(" GENERATED BY DEFAULT AS IDENTITY"),
            // serial types on postgres, rowid aliasing on sqlite
            Dialect::Postgres | Dialect::Sqlite => {}
        }
    }
    if column.unique && !primary_key {
        sql.push_str(" UNIQUE");
    }
    if primary_key {
        sql.push_str(" PRIMARY KEY");
        if dialect == Dialect::Sqlite && column.auto_increment {
            sql.push_str(" AUTOINCREMENT");
        }
    }
    sql
}

/// Native type of `column` in `dialect`.
pub fn column_type(dialect: Dialect, column: &ColumnDef) -> String {
    let serial = dialect == Dialect::Postgres && column.auto_increment;
    let ty = match (&column.column_type, dialect) {
        (ColumnType::Integer | ColumnType::BigInteger | ColumnType::SmallInteger, Dialect::Sqlite) => {
            "INTEGER"
        }
        (ColumnType::Integer, Dialect::Postgres) if serial => "SERIAL",
        (ColumnType::BigInteger, Dialect::Postgres) if serial => "BIGSERIAL",
        (ColumnType::SmallInteger, Dialect::Postgres) if serial => "SMALLSERIAL",
        (ColumnType::Integer, Dialect::MySql) => "INT",
        (ColumnType::Integer, _) => "INTEGER",
        (ColumnType::BigInteger, _) => "BIGINT",
        (ColumnType::SmallInteger, _) => "SMALLINT",
        (ColumnType::Boolean, _) => "BOOLEAN",
        (ColumnType::Text, _) => "TEXT",
        (ColumnType::String(length), _) => return format!("VARCHAR({length})"),
        (ColumnType::Decimal { precision, scale }, _) => {
            return format!("DECIMAL({precision}, {scale})");
        }
        (ColumnType::Float, Dialect::Sqlite) => "REAL",
        (ColumnType::Float, Dialect::MySql) => "DOUBLE",
        (ColumnType::Float, _) => "DOUBLE PRECISION",
        (ColumnType::Date, _) => "DATE",
        (ColumnType::Timestamp, Dialect::MySql) => "DATETIME",
        (ColumnType::Timestamp, _) => "TIMESTAMP",
        (ColumnType::Json, Dialect::Postgres) => "JSONB",
        (ColumnType::Json, Dialect::MySql) => "JSON",
        (ColumnType::Json, _) => "TEXT",
        (ColumnType::Uuid, Dialect::Postgres) => "UUID",
        (ColumnType::Uuid, Dialect::MySql) => "CHAR(36)",
        (ColumnType::Uuid, _) => "TEXT",
    };
    ty.to_string()
}

/// Statement setting the sequence behind `table.column` past the largest
/// value present. Binds the quoted table name and the column name.
pub fn sequence_reset(dialect: Dialect, table: &str, column: &str) -> String {
    format!(
        "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE(MAX({}), 0) + 1, false) FROM {}",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.quote(column),
        dialect.quote(table)
    )
}
