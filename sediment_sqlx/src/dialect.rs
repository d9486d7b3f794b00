//! SQL dialects and the small differences between them.

use std::fmt;

/// The SQL dialect of a connection, picked from its URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite.
    Sqlite,
    /// MySQL and MariaDB.
    MySql,
    /// PostgreSQL.
    Postgres,
    /// Anything else reachable through the `Any` driver. Rendered as ANSI
    /// SQL, without index introspection.
    Other,
}

impl Dialect {
    /// Dialect of a connection URL such as `postgres://...`.
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" => Dialect::Sqlite,
            "mysql" | "mariadb" => Dialect::MySql,
            "postgres" | "postgresql" => Dialect::Postgres,
            _ => Dialect::Other,
        }
    }

    /// Whether DDL can be rolled back inside a transaction.
    pub fn transactional_ddl(&self) -> bool {
        matches!(self, Dialect::Sqlite | Dialect::Postgres)
    }

    /// Quotes an identifier.
    pub fn quote(&self, identifier: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            _ => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    /// Bind placeholder for the `n`th parameter, starting at 1.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::Sqlite => "sqlite",
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Other => "ansi",
        };
        f.write_str(name)
    }
}
