//! # Converging migrations
//!
//! Applies a small shop schema to an in-memory database, changes the
//! database by hand, and runs the same descriptors again. The second run
//! skips what already exists instead of failing.
//!
//! ```text
//! cargo run -p sediment --example in-memory
//! ```

use sediment::prelude::*;
use sediment_mem::InMemoryBackend;

fn descriptors() -> Vec<Descriptor> {
    let products = Descriptor::new("2024_01_10_080000", "create_products_table")
        .up(Operation::create_table(
            TableDef::new("products")
                .column(
                    ColumnDef::new("id", ColumnType::BigInteger)
                        .primary_key()
                        .auto_increment(),
                )
                .column(ColumnDef::new("name", ColumnType::String(255)))
                .column(ColumnDef::new(
                    "price",
                    ColumnType::Decimal {
                        precision: 10,
                        scale: 2,
                    },
                )),
        ))
        .with_derived_reverse()
        .expect("create table is reversible");

    let sku = Descriptor::new("2024_02_01_120000", "add_sku_to_products")
        .up(Operation::add_column(
            "products",
            ColumnDef::new("sku", ColumnType::String(32)).nullable(),
        ))
        .up(Operation::add_index(
            IndexDef::new("products_sku_index", "products", ["sku"]).unique(),
        ))
        .with_derived_reverse()
        .expect("add column and index are reversible");

    vec![products, sku]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();

    let first = Migrator::new(
        backend.clone(),
        descriptors()[..1].to_vec(),
        MigratorConfig::default(),
    );
    first.migrate(&cancel).await?;

    // Someone adds the column by hand before the next release ships.
    backend
        .run_out_of_band(&Operation::add_column(
            "products",
            ColumnDef::new("sku", ColumnType::String(32)).nullable(),
        ))
        .await?;

    let migrator = Migrator::new(backend.clone(), descriptors(), MigratorConfig::default());
    let report = migrator.migrate(&cancel).await?;
    log::info!("Applied {:?} in batches {:?}", report.applied, report.batches);

    for status in migrator.status().await? {
        log::info!("{} {} {:?}", status.id, status.name, status.state);
    }
    let snapshot = migrator.snapshot().await?;
    for (table, shape) in &snapshot.tables {
        log::info!("{table}: columns {:?}, indexes {:?}", shape.columns, shape.indexes);
    }
    Ok(())
}
