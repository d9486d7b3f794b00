mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use sediment_core::prelude::*;
use sediment_core::{Ledger, MigrationLock, MigrationRecord, MigrationState, PlanningError};
use sediment_mem::InMemoryBackend;

#[tokio::test]
async fn migrate_twice_is_the_same_as_once() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();

    let first = migrator(&backend, vec![create_t(), add_y()])
        .migrate(&cancel)
        .await
        .expect("first run should succeed");
    assert_eq!(first.applied, vec!["2023_01_01_000000", "2023_01_02_000000"]);
    assert_eq!(first.batches, vec![1]);
    let after_first = backend.snapshot().await.unwrap();

    let second = migrator(&backend, vec![create_t(), add_y()])
        .migrate(&cancel)
        .await
        .expect("second run should succeed");
    assert!(second.is_noop());
    assert!(second.applied.is_empty());
    assert_eq!(backend.snapshot().await.unwrap(), after_first);
    assert_eq!(backend.applied().await.unwrap().len(), 2);
}

#[tokio::test]
async fn scenario_a_b_converges_on_both_columns() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        migrator(&backend, vec![create_t(), add_y()])
            .migrate(&cancel)
            .await
            .unwrap();
    }

    let snapshot = migrator(&backend, vec![]).snapshot().await.unwrap();
    assert_eq!(tables(&snapshot), vec!["t"]);
    assert_eq!(columns(&snapshot, "t"), vec!["x", "y"]);
    let records = backend.applied().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.batch == 1));
}

#[tokio::test]
async fn column_added_out_of_band_is_not_added_again() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_t()]).migrate(&cancel).await.unwrap();

    backend
        .run_out_of_band(&Operation::add_column(
            "t",
            ColumnDef::new("y", ColumnType::Text).nullable(),
        ))
        .await
        .unwrap();

    let report = migrator(&backend, vec![create_t(), add_y()])
        .migrate(&cancel)
        .await
        .expect("guarded add column should skip");
    assert_eq!(report.applied, vec!["2023_01_02_000000"]);
    assert_eq!(report.batches, vec![2]);
}

#[tokio::test]
async fn descriptors_apply_in_ascending_id_order() {
    init_logging();
    let backend = InMemoryBackend::default();

    // add_y fails unless create_t ran first.
    let report = migrator(&backend, vec![add_y(), create_t()])
        .migrate(&CancellationToken::new())
        .await
        .expect("should sort before applying");
    assert_eq!(report.applied, vec!["2023_01_01_000000", "2023_01_02_000000"]);
}

#[tokio::test]
async fn forward_step_on_missing_table_fails_the_descriptor() {
    init_logging();
    let backend = InMemoryBackend::default();

    let err = migrator(&backend, vec![add_y()])
        .migrate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.descriptor_id(), Some("2023_01_02_000000"));
    assert!(err.to_string().contains("table t does not exist"));
    assert!(!err.is_retryable());
    assert!(backend.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn failure_keeps_earlier_descriptors_and_skips_later_ones() {
    init_logging();
    let backend = InMemoryBackend::default();
    let broken = Descriptor::new("2023_01_01_500000", "broken")
        .up(Operation::drop_column("t", "x"))
        .up(Operation::add_index(IndexDef::new("t_missing_index", "t", ["missing"])));

    let err = migrator(&backend, vec![create_t(), broken, add_y()])
        .migrate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.descriptor_id(), Some("2023_01_01_500000"));

    let applied: Vec<String> = backend
        .applied()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(applied, vec!["2023_01_01_000000"]);

    // The failing descriptor ran in a transaction: its drop column was undone.
    let snapshot = backend.snapshot().await.unwrap();
    assert_eq!(columns(&snapshot, "t"), vec!["x"]);
    assert_eq!(backend.lock_owner().await, None);
}

#[tokio::test]
async fn rollback_removes_exactly_the_latest_batch() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();

    let late_id = Descriptor::new("2023_09_01_000000", "create_reviews_table")
        .up(Operation::create_table(
            TableDef::new("reviews").column(ColumnDef::new("id", ColumnType::BigInteger)),
        ))
        .with_derived_reverse()
        .unwrap();
    migrator(&backend, vec![late_id.clone()])
        .migrate(&cancel)
        .await
        .unwrap();

    // Added later with a smaller id: lands in batch 2.
    let early_id = Descriptor::new("2023_02_01_000000", "create_campaigns_table")
        .up(Operation::create_table(
            TableDef::new("campaigns").column(ColumnDef::new("id", ColumnType::BigInteger)),
        ))
        .with_derived_reverse()
        .unwrap();
    let runner = migrator(&backend, vec![late_id, early_id]);
    let report = runner.migrate(&cancel).await.unwrap();
    assert_eq!(report.batches, vec![2]);

    let rollback = runner.rollback(1, &cancel).await.unwrap();
    assert_eq!(rollback.batches, vec![2]);
    assert_eq!(rollback.reverted, vec!["2023_02_01_000000"]);

    let snapshot = runner.snapshot().await.unwrap();
    assert_eq!(tables(&snapshot), vec!["reviews"]);
    let remaining: Vec<String> = backend
        .applied()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(remaining, vec!["2023_09_01_000000"]);
}

#[tokio::test]
async fn rollback_reverts_a_batch_in_descending_id_order() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    let runner = migrator(&backend, vec![create_t(), add_y()]);
    runner.migrate(&cancel).await.unwrap();

    let report = runner.rollback(1, &cancel).await.unwrap();
    assert_eq!(report.reverted, vec!["2023_01_02_000000", "2023_01_01_000000"]);
    assert!(runner.snapshot().await.unwrap().tables.is_empty());
    assert!(backend.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn reverse_restores_the_introspectable_schema() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();

    let products = Descriptor::new("2023_01_10_000000", "create_products_table")
        .up(Operation::create_table(
            TableDef::new("products")
                .column(ColumnDef::new("id", ColumnType::BigInteger).primary_key())
                .column(ColumnDef::new("name", ColumnType::String(255))),
        ))
        .with_derived_reverse()
        .unwrap();
    let runner = migrator(&backend, vec![products.clone()]);
    runner.migrate(&cancel).await.unwrap();
    let before = runner.snapshot().await.unwrap();

    let reshape = Descriptor::new("2023_02_10_000000", "reshape_products")
        .up(Operation::create_table(
            TableDef::new("reviews")
                .column(ColumnDef::new("id", ColumnType::BigInteger).primary_key())
                .column(ColumnDef::new("body", ColumnType::Text)),
        ))
        .up(Operation::add_column(
            "products",
            ColumnDef::new("rating", ColumnType::SmallInteger).nullable(),
        ))
        .up(Operation::add_index(IndexDef::new(
            "products_rating_index",
            "products",
            ["rating"],
        )))
        .up(Operation::rename_column("products", "name", "title"))
        .up(Operation::rename_table("reviews", "product_reviews"))
        .with_derived_reverse()
        .unwrap();
    let runner = migrator(&backend, vec![products, reshape]);
    runner.migrate(&cancel).await.unwrap();

    let during = runner.snapshot().await.unwrap();
    assert!(during.has_table("product_reviews"));
    assert!(during.has_column("products", "title"));
    assert!(during.has_index("products", "products_rating_index"));

    runner.rollback(1, &cancel).await.unwrap();
    assert_eq!(runner.snapshot().await.unwrap(), before);
}

#[tokio::test]
async fn reverse_of_vanished_objects_is_a_no_op() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    let runner = migrator(&backend, vec![create_t(), add_y()]);
    runner.migrate(&cancel).await.unwrap();

    backend
        .run_out_of_band(&Operation::drop_table("t"))
        .await
        .unwrap();

    let report = runner.rollback(1, &cancel).await.expect("best effort revert");
    assert_eq!(report.reverted.len(), 2);
    assert!(backend.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_c_out_of_band_index_is_not_duplicated() {
    init_logging();
    let backend = InMemoryBackend::default();
    backend
        .run_out_of_band(&Operation::create_table(
            TableDef::new("products")
                .column(ColumnDef::new("id", ColumnType::BigInteger))
                .column(ColumnDef::new("sku", ColumnType::String(64))),
        ))
        .await
        .unwrap();
    backend
        .run_out_of_band(&Operation::add_index(IndexDef::new(
            "products_sku_index",
            "products",
            ["sku"],
        )))
        .await
        .unwrap();

    let add_index = Descriptor::new("2023_03_01_000000", "add_sku_index_to_products")
        .up(Operation::add_index(IndexDef::new(
            "products_sku_index",
            "products",
            ["sku"],
        )))
        .with_derived_reverse()
        .unwrap();
    let report = migrator(&backend, vec![add_index])
        .migrate(&CancellationToken::new())
        .await
        .expect("existing index should be skipped");
    assert_eq!(report.applied, vec!["2023_03_01_000000"]);

    let snapshot = backend.snapshot().await.unwrap();
    let indexes: Vec<&str> = snapshot.tables["products"]
        .indexes
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(indexes, vec!["products_sku_index"]);
}

#[tokio::test]
async fn interrupted_recreate_table_resumes_without_duplicating_rows() {
    init_logging();
    let backend = InMemoryBackend::default().non_transactional();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_countries(), create_zones()])
        .migrate(&cancel)
        .await
        .unwrap();
    backend.insert_rows("zones", 5).await.unwrap();

    let descriptors = vec![
        create_countries(),
        create_zones(),
        add_zone_country_foreign_key(),
    ];

    // Fail after the new table exists and holds the rows, before the old
    // one is dropped.
    backend
        .fail_when(|op| matches!(op, Operation::DropTable { table } if table == "zones"))
        .await;
    let err = migrator(&backend, descriptors.clone())
        .migrate(&cancel)
        .await
        .unwrap_err();
    assert_eq!(err.descriptor_id(), Some("2023_06_01_090000"));
    assert_eq!(backend.rows("zones").await, Some(5));
    assert_eq!(backend.rows("zones_new").await, Some(5));

    backend.clear_failures().await;
    let report = migrator(&backend, descriptors)
        .migrate(&cancel)
        .await
        .expect("rerun should complete the recreate");
    assert_eq!(report.applied, vec!["2023_06_01_090000"]);
    assert_eq!(backend.rows("zones").await, Some(5));
    assert_eq!(backend.rows("zones_new").await, None);
    assert_eq!(backend.applied().await.unwrap().len(), 3);
}

#[tokio::test]
async fn recreate_table_copies_into_an_empty_leftover_staging_table() {
    init_logging();
    let backend = InMemoryBackend::default().non_transactional();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_countries(), create_zones()])
        .migrate(&cancel)
        .await
        .unwrap();
    backend.insert_rows("zones", 3).await.unwrap();
    backend
        .run_out_of_band(&Operation::create_table(TableDef::new("zones_new")))
        .await
        .unwrap();

    migrator(
        &backend,
        vec![create_countries(), create_zones(), add_zone_country_foreign_key()],
    )
    .migrate(&cancel)
    .await
    .unwrap();
    assert_eq!(backend.rows("zones").await, Some(3));
    assert_eq!(backend.rows("zones_new").await, None);
}

#[tokio::test]
async fn failed_recreate_in_a_transaction_leaves_nothing_behind() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_countries(), create_zones()])
        .migrate(&cancel)
        .await
        .unwrap();
    backend.insert_rows("zones", 5).await.unwrap();

    backend
        .fail_when(|op| matches!(op, Operation::RenameTable { .. }))
        .await;
    migrator(
        &backend,
        vec![create_countries(), create_zones(), add_zone_country_foreign_key()],
    )
    .migrate(&cancel)
    .await
    .unwrap_err();

    assert_eq!(backend.rows("zones").await, Some(5));
    assert_eq!(backend.rows("zones_new").await, None);
}

#[tokio::test]
async fn partial_application_without_transactions_is_safe_to_rerun() {
    init_logging();
    let backend = InMemoryBackend::default().non_transactional();
    let cancel = CancellationToken::new();
    let descriptor = Descriptor::new("2023_04_01_000000", "add_code_to_t")
        .up(Operation::add_column(
            "t",
            ColumnDef::new("code", ColumnType::String(32)).nullable(),
        ))
        .up(Operation::add_index(IndexDef::new("t_code_index", "t", ["code"]).unique()))
        .with_derived_reverse()
        .unwrap();

    backend
        .fail_when(|op| matches!(op, Operation::AddIndex(_)))
        .await;
    migrator(&backend, vec![create_t(), descriptor.clone()])
        .migrate(&cancel)
        .await
        .unwrap_err();
    let snapshot = backend.snapshot().await.unwrap();
    assert!(snapshot.has_column("t", "code"));
    assert!(!snapshot.has_index("t", "t_code_index"));

    backend.clear_failures().await;
    migrator(&backend, vec![create_t(), descriptor])
        .migrate(&cancel)
        .await
        .expect("rerun should skip the column and add the index");
    assert!(backend.snapshot().await.unwrap().has_index("t", "t_code_index"));
}

#[tokio::test]
async fn held_lock_yields_retryable_contention() {
    init_logging();
    let backend = InMemoryBackend::default();
    let runner = migrator(&backend, vec![create_t()]);
    runner.bootstrap().await.unwrap();
    backend.hold_lock("another-runner", Utc::now()).await;

    let err = runner.migrate(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MigrationError::LockContention { attempts: 3 }));
    assert!(err.is_retryable());
    assert_eq!(backend.lock_owner().await.as_deref(), Some("another-runner"));
    assert!(backend.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_lock_is_taken_over() {
    init_logging();
    let backend = InMemoryBackend::default();
    let config = MigratorConfig {
        lock_stale_after: Duration::from_secs(60),
        ..config()
    };
    let runner = Migrator::new(backend.clone(), vec![create_t()], config);
    runner.bootstrap().await.unwrap();
    backend
        .hold_lock("crashed-runner", Utc::now() - chrono::Duration::hours(1))
        .await;

    let report = runner.migrate(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.applied, vec!["2023_01_01_000000"]);
    assert_eq!(backend.lock_owner().await, None);
}

#[tokio::test]
async fn concurrent_runners_apply_each_descriptor_once() {
    init_logging();
    let backend = InMemoryBackend::default();
    let config = MigratorConfig {
        lock_retries: 50,
        ..config()
    };
    let first = Migrator::new(backend.clone(), vec![create_t(), add_y()], config.clone());
    let second = Migrator::new(backend.clone(), vec![create_t(), add_y()], config);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(first.migrate(&cancel), second.migrate(&cancel));
    let a = a.expect("first runner");
    let b = b.expect("second runner");
    assert_eq!(a.applied.len() + b.applied.len(), 2);
    assert_eq!(backend.applied().await.unwrap().len(), 2);
    assert_eq!(backend.lock_owner().await, None);
}

#[tokio::test]
async fn cancellation_is_checked_between_descriptors() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = migrator(&backend, vec![create_t(), add_y()])
        .migrate(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled { remaining: 2 }));
    assert!(backend.applied().await.unwrap().is_empty());
    assert_eq!(backend.lock_owner().await, None);
}

#[tokio::test]
async fn edited_descriptor_is_refused() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_t()]).migrate(&cancel).await.unwrap();

    let edited = Descriptor::new("2023_01_01_000000", "create_t")
        .up(Operation::create_table(
            TableDef::new("t")
                .column(ColumnDef::new("x", ColumnType::Integer))
                .column(ColumnDef::new("z", ColumnType::Integer)),
        ))
        .with_derived_reverse()
        .unwrap();
    let err = migrator(&backend, vec![edited.clone()])
        .migrate(&cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Planning(PlanningError::ChecksumMismatch { .. })
    ));
    assert_eq!(err.descriptor_id(), Some("2023_01_01_000000"));

    let lenient = MigratorConfig {
        verify_checksums: false,
        ..config()
    };
    let report = Migrator::new(backend.clone(), vec![edited], lenient)
        .migrate(&cancel)
        .await
        .unwrap();
    assert!(report.is_noop());
}

#[tokio::test]
async fn duplicate_ids_are_a_planning_error() {
    init_logging();
    let backend = InMemoryBackend::default();
    let twin = Descriptor::new("2023_01_01_000000", "create_t_v2")
        .up(Operation::create_table(
            TableDef::new("t").column(ColumnDef::new("x", ColumnType::Integer)),
        ));

    let err = migrator(&backend, vec![create_t(), twin])
        .migrate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Planning(PlanningError::DuplicateId { .. })
    ));
    assert!(backend.snapshot().await.unwrap().tables.keys().all(|t| t != "t"));
}

#[tokio::test]
async fn table_prefix_applies_to_tables_indexes_ledger_and_sql() {
    init_logging();
    let config = MigratorConfig {
        table_prefix: "shop_".to_string(),
        ..config()
    };
    let backend = InMemoryBackend::new(config.ledger_tables());
    let descriptor = Descriptor::new("2023_07_01_000000", "rename_product_pivot")
        .up(Operation::create_table(
            TableDef::new("product_tag")
                .column(ColumnDef::new("product_id", ColumnType::BigInteger))
                .column(ColumnDef::new("tag_id", ColumnType::BigInteger))
                .primary_key(["product_id", "tag_id"]),
        ))
        .up(Operation::rename_table("product_tag", "product_tags"))
        .up(Operation::add_index(IndexDef::new(
            "product_tags_tag_index",
            "product_tags",
            ["tag_id"],
        )))
        .up_always(Operation::sql("DELETE FROM {prefix}product_tags"));
    let runner = Migrator::new(backend.clone(), vec![descriptor.clone()], config);
    runner.migrate(&CancellationToken::new()).await.unwrap();

    let snapshot = backend.snapshot().await.unwrap();
    assert!(snapshot.has_table("shop_migrations"));
    assert!(snapshot.has_table("shop_migrations_lock"));
    assert!(snapshot.has_index("shop_product_tags", "shop_product_tags_tag_index"));
    assert_eq!(
        backend.executed_sql().await,
        vec!["DELETE FROM shop_product_tags"]
    );

    // The ledger checksum is the unprefixed one.
    let records = backend.applied().await.unwrap();
    assert_eq!(records[0].checksum, descriptor.checksum());
}

#[tokio::test]
async fn step_mode_records_one_batch_per_descriptor() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    let runner = migrator(&backend, vec![create_t(), add_y()]);

    let report = runner
        .migrate_with(
            MigrateOptions {
                step: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(report.batches, vec![1, 2]);

    let rollback = runner.rollback(1, &cancel).await.unwrap();
    assert_eq!(rollback.reverted, vec!["2023_01_02_000000"]);
    let snapshot = runner.snapshot().await.unwrap();
    assert_eq!(columns(&snapshot, "t"), vec!["x"]);
}

#[tokio::test]
async fn dry_run_plans_without_touching_the_database() {
    init_logging();
    let backend = InMemoryBackend::default();
    let report = migrator(&backend, vec![add_y(), create_t()])
        .migrate_with(
            MigrateOptions {
                dry_run: true,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.planned, vec!["2023_01_01_000000", "2023_01_02_000000"]);
    assert!(report.applied.is_empty());
    assert!(backend.snapshot().await.unwrap().tables.is_empty());
}

#[tokio::test]
async fn status_reports_applied_pending_and_orphaned() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();

    let fresh = migrator(&backend, vec![create_t()]).status().await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].state, MigrationState::Pending);

    let removed = Descriptor::new("2022_12_01_000000", "create_legacy_table").up(
        Operation::create_table(
            TableDef::new("legacy").column(ColumnDef::new("id", ColumnType::Integer)),
        ),
    );
    migrator(&backend, vec![removed, create_t()])
        .migrate(&cancel)
        .await
        .unwrap();

    let status = migrator(&backend, vec![create_t(), add_y()])
        .status()
        .await
        .unwrap();
    let ids: Vec<&str> = status.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["2022_12_01_000000", "2023_01_01_000000", "2023_01_02_000000"]
    );
    assert!(matches!(status[0].state, MigrationState::Orphaned { batch: 1, .. }));
    assert!(matches!(status[1].state, MigrationState::Applied { batch: 1, .. }));
    assert_eq!(status[2].state, MigrationState::Pending);
}

#[tokio::test]
async fn reset_reverts_every_batch() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_t()]).migrate(&cancel).await.unwrap();
    let runner = migrator(&backend, vec![create_t(), add_y()]);
    runner.migrate(&cancel).await.unwrap();

    let report = runner.reset(&cancel).await.unwrap();
    assert_eq!(report.batches, vec![2, 1]);
    assert!(runner.snapshot().await.unwrap().tables.is_empty());
    assert!(backend.applied().await.unwrap().is_empty());

    let again = runner.reset(&cancel).await.unwrap();
    assert!(again.batches.is_empty());
}

#[tokio::test]
async fn rollback_refuses_unknown_descriptors() {
    init_logging();
    let backend = InMemoryBackend::default();
    let cancel = CancellationToken::new();
    migrator(&backend, vec![create_t()]).migrate(&cancel).await.unwrap();

    let err = migrator(&backend, vec![])
        .rollback(1, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Planning(PlanningError::UnknownDescriptor { ref name, .. }) if name == "create_t"
    ));
    assert_eq!(backend.applied().await.unwrap().len(), 1);
}

fn create_u() -> Descriptor {
    Descriptor::new("2023_01_03_000000", "create_u")
        .up(Operation::create_table(
            TableDef::new("u").column(ColumnDef::new("id", ColumnType::BigInteger)),
        ))
        .with_derived_reverse()
        .unwrap()
}

fn ledger_ids(records: Vec<MigrationRecord>) -> Vec<String> {
    records.into_iter().map(|r| r.id).collect()
}

#[tokio::test]
async fn cancelled_rollback_keeps_the_ledger_in_step_with_the_schema() {
    init_logging();
    let backend = InMemoryBackend::default();
    let runner = migrator(&backend, vec![create_t(), create_u()]);
    runner.migrate(&CancellationToken::new()).await.unwrap();

    backend
        .slow_when(
            |op| matches!(op, Operation::DropTable { table } if table == "u"),
            Duration::from_millis(200),
        )
        .await;
    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(runner.rollback(1, &cancel), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    assert!(matches!(
        result.unwrap_err(),
        MigrationError::Cancelled { remaining: 1 }
    ));

    assert_eq!(tables(&runner.snapshot().await.unwrap()), vec!["t"]);
    assert_eq!(
        ledger_ids(backend.applied().await.unwrap()),
        vec!["2023_01_01_000000"]
    );
    assert_eq!(backend.lock_owner().await, None);

    let report = runner.migrate(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.planned, vec!["2023_01_03_000000"]);
    assert!(runner.snapshot().await.unwrap().has_table("u"));
}

#[tokio::test]
async fn failed_rollback_keeps_records_only_for_what_is_still_applied() {
    init_logging();
    let backend = InMemoryBackend::default().non_transactional();
    let runner = migrator(&backend, vec![create_t(), create_u()]);
    let cancel = CancellationToken::new();
    runner.migrate(&cancel).await.unwrap();

    backend
        .fail_when(|op| matches!(op, Operation::DropTable { table } if table == "t"))
        .await;
    let err = runner.rollback(1, &cancel).await.unwrap_err();
    assert_eq!(err.descriptor_id(), Some("2023_01_01_000000"));

    assert_eq!(tables(&runner.snapshot().await.unwrap()), vec!["t"]);
    assert_eq!(
        ledger_ids(backend.applied().await.unwrap()),
        vec!["2023_01_01_000000"]
    );

    backend.clear_failures().await;
    let report = runner.rollback(1, &cancel).await.unwrap();
    assert_eq!(report.reverted, vec!["2023_01_01_000000"]);
    assert!(backend.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn long_descriptor_keeps_the_lock_fresh() {
    init_logging();
    let backend = InMemoryBackend::default();
    let config = MigratorConfig {
        lock_stale_after: Duration::from_millis(300),
        ..config()
    };
    let runner = Migrator::new(backend.clone(), vec![create_t()], config);
    backend
        .slow_when(
            |op| matches!(op, Operation::CreateTable(t) if t.name == "t"),
            Duration::from_secs(1),
        )
        .await;

    let cancel = CancellationToken::new();
    let (report, taken) = tokio::join!(runner.migrate(&cancel), async {
        tokio::time::sleep(Duration::from_millis(600)).await;
        backend
            .try_lock("runner-b", Duration::from_millis(300))
            .await
            .unwrap()
    });
    assert!(!taken, "a lock renewed during the run must not look stale");
    assert_eq!(report.unwrap().applied, vec!["2023_01_01_000000"]);
    assert_eq!(backend.lock_owner().await, None);
}

#[tokio::test]
async fn run_stops_when_its_lock_is_taken_over() {
    init_logging();
    let backend = InMemoryBackend::default();
    let config = MigratorConfig {
        lock_stale_after: Duration::from_millis(300),
        ..config()
    };
    let runner = Migrator::new(backend.clone(), vec![create_t(), add_y()], config);
    backend
        .slow_when(
            |op| matches!(op, Operation::CreateTable(t) if t.name == "t"),
            Duration::from_millis(600),
        )
        .await;

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(runner.migrate(&cancel), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        backend.hold_lock("runner-b", Utc::now()).await;
    });
    assert!(matches!(result.unwrap_err(), MigrationError::LockLost { .. }));

    // The descriptor in flight finishes; the next one is never started.
    assert_eq!(
        ledger_ids(backend.applied().await.unwrap()),
        vec!["2023_01_01_000000"]
    );
    assert_eq!(backend.lock_owner().await.as_deref(), Some("runner-b"));
}
