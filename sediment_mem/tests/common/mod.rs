#![allow(dead_code)]

use std::time::Duration;

use sediment_core::SchemaSnapshot;
use sediment_core::prelude::*;
use sediment_mem::InMemoryBackend;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast lock retries so contention tests do not sleep for long.
pub fn config() -> MigratorConfig {
    MigratorConfig {
        lock_retries: 2,
        initial_lock_retry_delay: Duration::from_millis(5),
        max_lock_retry_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn migrator(backend: &InMemoryBackend, descriptors: Vec<Descriptor>) -> Migrator<InMemoryBackend> {
    Migrator::new(backend.clone(), descriptors, config())
}

/// Scenario A: creates `t(x)`.
pub fn create_t() -> Descriptor {
    Descriptor::new("2023_01_01_000000", "create_t")
        .up(Operation::create_table(
            TableDef::new("t").column(ColumnDef::new("x", ColumnType::Integer)),
        ))
        .with_derived_reverse()
        .unwrap()
}

/// Scenario B: adds `t.y` if absent.
pub fn add_y() -> Descriptor {
    Descriptor::new("2023_01_02_000000", "add_y_to_t")
        .up(Operation::add_column(
            "t",
            ColumnDef::new("y", ColumnType::Text).nullable(),
        ))
        .with_derived_reverse()
        .unwrap()
}

pub fn create_countries() -> Descriptor {
    Descriptor::new("2023_05_04_115900", "create_countries_table")
        .up(Operation::create_table(
            TableDef::new("countries")
                .column(
                    ColumnDef::new("id", ColumnType::BigInteger)
                        .primary_key()
                        .auto_increment(),
                )
                .column(ColumnDef::new("name", ColumnType::String(255)))
                .column(ColumnDef::new("iso_code", ColumnType::String(2)).unique()),
        ))
        .with_derived_reverse()
        .unwrap()
}

pub fn create_zones() -> Descriptor {
    Descriptor::new("2023_05_04_120000", "create_zones_table")
        .up(Operation::create_table(
            TableDef::new("zones")
                .column(
                    ColumnDef::new("id", ColumnType::BigInteger)
                        .primary_key()
                        .auto_increment(),
                )
                .column(ColumnDef::new("name", ColumnType::String(255)))
                .column(ColumnDef::new("country_id", ColumnType::BigInteger)),
        ))
        .with_derived_reverse()
        .unwrap()
}

/// Rebuilds `zones` with a foreign key to `countries`.
pub fn add_zone_country_foreign_key() -> Descriptor {
    let rebuilt = TableDef::new("zones_new")
        .column(
            ColumnDef::new("id", ColumnType::BigInteger)
                .primary_key()
                .auto_increment(),
        )
        .column(ColumnDef::new("name", ColumnType::String(255)))
        .column(ColumnDef::new("country_id", ColumnType::BigInteger))
        .foreign_key(
            ForeignKey::new("country_id", "countries", "id")
                .on_delete(ReferentialAction::Cascade),
        );
    Descriptor::new("2023_06_01_090000", "add_country_foreign_key_to_zones")
        .up(Operation::recreate_table(
            "zones",
            rebuilt,
            "INSERT INTO {prefix}zones_new (id, name, country_id) \
             SELECT id, name, country_id FROM {prefix}zones",
            Some("zones".to_string()),
        ))
}

pub fn tables(snapshot: &SchemaSnapshot) -> Vec<&str> {
    snapshot.tables.keys().map(String::as_str).collect()
}

pub fn columns<'a>(snapshot: &'a SchemaSnapshot, table: &str) -> Vec<&'a str> {
    snapshot.tables[table]
        .columns
        .iter()
        .map(String::as_str)
        .collect()
}
