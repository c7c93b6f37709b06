//! PostgreSQL tests for tidemark-core.
//!
//! Skipped unless TEST_DATABASE_URL is set, e.g.:
//!   TEST_DATABASE_URL="host=localhost user=postgres dbname=tidemark_test"
//!
//! Run with: cargo test --test postgres_test

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidemark_core::changelog::Changelog;
use tidemark_core::changes::{ColumnDef, CreateTable, Sql};
use tidemark_core::changeset::ChangeSet;
use tidemark_core::config::{DatabaseConfig, SslMode, TidemarkConfig};
use tidemark_core::db::{self, quote_ident};
use tidemark_core::error::TidemarkError;
use tidemark_core::history::ExecType;
use tidemark_core::{RollbackTarget, Tidemark};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Connect a side client and create a fresh schema for one test.
async fn setup_schema(url: &str, prefix: &str) -> (tokio_postgres::Client, String) {
    let client = db::connect_with_full_config(url, &SslMode::Disable, 0, 10, 0, 0)
        .await
        .expect("Failed to connect to DB");
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let schema = format!("tidemark_test_{}_{}_{}", prefix, std::process::id(), id);
    client
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {0} CASCADE; CREATE SCHEMA {0}",
            quote_ident(&schema)
        ))
        .await
        .expect("Failed to create test schema");
    (client, schema)
}

async fn teardown_schema(client: &tokio_postgres::Client, schema: &str) {
    let _ = client
        .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema)))
        .await;
}

fn test_config(url: &str, schema: &str) -> TidemarkConfig {
    let mut config = TidemarkConfig {
        database: DatabaseConfig {
            url: Some(url.to_string()),
            ssl_mode: SslMode::Disable,
            ..Default::default()
        },
        ..Default::default()
    };
    config.changelog.schema = schema.to_string();
    config.lock.poll_interval_ms = 100;
    config.lock.wait_timeout_secs = 10;
    config
}

fn table(schema: &str, id: &str, name: &str) -> ChangeSet {
    let change = CreateTable {
        schema: Some(schema.to_string()),
        table: name.to_string(),
        columns: vec![ColumnDef::new("id", "BIGINT").primary_key()],
    };
    ChangeSet::new(id, "alice", "db/main.toml").with_change(Arc::new(change))
}

async fn table_exists(client: &tokio_postgres::Client, schema: &str, name: &str) -> bool {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
            &[&schema, &name],
        )
        .await
        .unwrap();
    row.get(0)
}

#[tokio::test]
async fn test_migrate_tag_and_rollback_roundtrip() {
    let Some(url) = test_url() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let (client, schema) = setup_schema(&url, "roundtrip").await;
    let tm = Tidemark::new(test_config(&url, &schema)).await.unwrap();

    tm.tag("empty").await.unwrap();
    let log = Changelog::new("db/main.toml")
        .with_change_set(table(&schema, "1", "users"))
        .with_change_set(table(&schema, "2", "orders"));

    let report = tm.migrate(&log).await.unwrap();
    assert_eq!(report.executed, 2);
    assert!(table_exists(&client, &schema, "orders").await);

    let again = tm.migrate(&log).await.unwrap();
    assert_eq!(again.executed, 0);

    tm.rollback(&log, &RollbackTarget::Tag("empty".to_string()))
        .await
        .unwrap();
    assert!(!table_exists(&client, &schema, "users").await);
    assert!(tm.history().await.unwrap().is_empty());
    assert!(!tm.list_locks().await.unwrap().locked);

    teardown_schema(&client, &schema).await;
}

#[tokio::test]
async fn test_failed_change_set_leaves_no_row() {
    let Some(url) = test_url() else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let (client, schema) = setup_schema(&url, "failure").await;
    let tm = Tidemark::new(test_config(&url, &schema)).await.unwrap();

    let broken = ChangeSet::new("2", "alice", "db/main.toml").with_change(Arc::new(Sql::new(
        &format!("INSERT INTO {}.nowhere VALUES (1)", quote_ident(&schema)),
    )));
    let log = Changelog::new("db/main.toml")
        .with_change_set(table(&schema, "1", "users"))
        .with_change_set(broken);

    let err = tm.migrate(&log).await.unwrap_err();
    assert!(matches!(err, TidemarkError::ExecutionFailed { .. }));

    let rows = tm.history().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].exec_type, ExecType::Executed);
    assert!(table_exists(&client, &schema, "users").await);
    assert!(!tm.list_locks().await.unwrap().locked);

    teardown_schema(&client, &schema).await;
}
