//! Catalog queries answering the [`Introspector`](sediment_core::Introspector)
//! questions for each dialect.

use sqlx::AnyConnection;

use crate::Dialect;

async fn names(
    conn: &mut AnyConnection,
    sql: &str,
    params: &[&str],
) -> Result<Vec<String>, sqlx::Error> {
    let mut query = sqlx::query_scalar::<_, String>(sql);
    for param in params {
        query = query.bind(*param);
    }
    query.fetch_all(conn).await
}

/// Names of all base tables in the current schema.
pub(crate) async fn tables(
    conn: &mut AnyConnection,
    dialect: Dialect,
) -> Result<Vec<String>, sqlx::Error> {
    let sql = match dialect {
        Dialect::Sqlite => {
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        Dialect::MySql => {
            "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME"
        }
        Dialect::Postgres => {
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        }
        Dialect::Other => {
            "SELECT table_name FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' ORDER BY table_name"
        }
    };
    names(conn, sql, &[]).await
}

pub(crate) async fn table_exists(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<bool, sqlx::Error> {
    let sql = match dialect {
        Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        Dialect::MySql => {
            "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
        }
        Dialect::Postgres => {
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1"
        }
        Dialect::Other => {
            "SELECT table_name FROM information_schema.tables WHERE table_name = ?"
        }
    };
    Ok(!names(conn, sql, &[table]).await?.is_empty())
}

/// Columns of `table` in declaration order. Empty when the table is missing.
pub(crate) async fn columns(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let sql = match dialect {
        Dialect::Sqlite => "SELECT name FROM pragma_table_info(?) ORDER BY cid",
        Dialect::MySql => {
            "SELECT CAST(COLUMN_NAME AS CHAR) FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION"
        }
        Dialect::Postgres => {
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 ORDER BY ordinal_position"
        }
        Dialect::Other => {
            "SELECT column_name FROM information_schema.columns \
             WHERE table_name = ? ORDER BY ordinal_position"
        }
    };
    names(conn, sql, &[table]).await
}

/// Index names of `table`. Always empty for [`Dialect::Other`].
pub(crate) async fn indexes(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let sql = match dialect {
        Dialect::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? ORDER BY name"
        }
        Dialect::MySql => {
            "SELECT DISTINCT CAST(INDEX_NAME AS CHAR) FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"
        }
        Dialect::Postgres => {
            "SELECT indexname::text FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1 ORDER BY indexname"
        }
        Dialect::Other => return Ok(Vec::new()),
    };
    names(conn, sql, &[table]).await
}

/// Columns of `table` filled from a sequence. Only Postgres reports any.
pub(crate) async fn generated_columns(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<Vec<String>, sqlx::Error> {
    if dialect != Dialect::Postgres {
        return Ok(Vec::new());
    }
    let sql = "SELECT column_name::text FROM information_schema.columns \
               WHERE table_schema = current_schema() AND table_name = $1 \
               AND (column_default LIKE 'nextval(%' OR is_identity = 'YES') \
               ORDER BY ordinal_position";
    names(conn, sql, &[table]).await
}

pub(crate) async fn column_exists(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
    column: &str,
) -> Result<bool, sqlx::Error> {
    Ok(columns(conn, dialect, table)
        .await?
        .iter()
        .any(|c| c == column))
}

pub(crate) async fn index_exists(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
    index: &str,
) -> Result<bool, sqlx::Error> {
    Ok(indexes(conn, dialect, table)
        .await?
        .iter()
        .any(|i| i == index))
}

pub(crate) async fn row_count(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<u64, sqlx::Error> {
    let sql = format!("SELECT COUNT(*) FROM {}", dialect.quote(table));
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(conn).await?;
    Ok(count.max(0) as u64)
}
