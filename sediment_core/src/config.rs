//! Migrator configuration.

use std::time::Duration;

use crate::ledger::LedgerTables;

/// Configuration for a [`Migrator`](crate::Migrator).
///
/// The table prefix is passed in here once, at startup, and applied to every
/// descriptor when the run is planned.
#[derive(Clone)]
pub struct MigratorConfig {
    /// Prefix added to every table and index name, including the ledger.
    pub table_prefix: String,

    /// Unprefixed name of the ledger table.
    pub ledger_table: String,

    /// Unprefixed name of the lock table.
    pub lock_table: String,

    /// Age after which a held lock is assumed abandoned by a crashed runner.
    ///
    /// Default: 10 minutes
    pub lock_stale_after: Duration,

    /// How many times to retry taking the lock before giving up.
    pub lock_retries: u32,

    /// Delay before the first lock retry. Subsequent retries back off
    /// exponentially.
    pub initial_lock_retry_delay: Duration,

    /// Upper bound for the lock retry delay.
    pub max_lock_retry_delay: Duration,

    /// Refuse to run when an applied descriptor's checksum changed.
    pub verify_checksums: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            ledger_table: "migrations".to_string(),
            lock_table: "migrations_lock".to_string(),
            lock_stale_after: Duration::from_secs(600),
            lock_retries: 5,
            initial_lock_retry_delay: Duration::from_millis(250),
            max_lock_retry_delay: Duration::from_secs(5),
            verify_checksums: true,
        }
    }
}

impl MigratorConfig {
    /// Sets the table prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// The bookkeeping table names with the prefix applied.
    pub fn ledger_tables(&self) -> LedgerTables {
        LedgerTables {
            ledger: format!("{}{}", self.table_prefix, self.ledger_table),
            lock: format!("{}{}", self.table_prefix, self.lock_table),
        }
    }
}

impl std::fmt::Debug for MigratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigratorConfig")
            .field("table_prefix", &self.table_prefix)
            .field("ledger_table", &self.ledger_table)
            .field("lock_table", &self.lock_table)
            .field("lock_stale_after", &self.lock_stale_after)
            .field("lock_retries", &self.lock_retries)
            .field("initial_lock_retry_delay", &self.initial_lock_retry_delay)
            .field("max_lock_retry_delay", &self.max_lock_retry_delay)
            .field("verify_checksums", &self.verify_checksums)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrator_config_has_sensible_defaults() {
        let config = MigratorConfig::default();
        assert_eq!(config.table_prefix, "");
        assert_eq!(config.lock_retries, 5);
        assert_eq!(config.lock_stale_after, Duration::from_secs(600));
        assert!(config.verify_checksums);
        assert_eq!(config.ledger_tables(), LedgerTables::default());
    }

    #[test]
    fn ledger_tables_carry_the_prefix() {
        let config = MigratorConfig::default().with_table_prefix("shopper_");
        let tables = config.ledger_tables();
        assert_eq!(tables.ledger, "shopper_migrations");
        assert_eq!(tables.lock, "shopper_migrations_lock");
    }
}
