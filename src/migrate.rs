//! Idempotent schema setup for data sources, run history and canonical
//! records. Timestamps are stored as Unix milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Create data_sources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            label TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            config_json TEXT NOT NULL DEFAULT '{}',
            interval_minutes INTEGER NOT NULL,
            last_run_at INTEGER,
            last_success_cursor TEXT,
            last_status TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(org_id, kind)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create run_records table (append-only history)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_records (
            id TEXT PRIMARY KEY,
            data_source_id TEXT NOT NULL,
            run_trigger TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            status TEXT NOT NULL,
            counts_json TEXT NOT NULL DEFAULT '{}',
            error TEXT,
            FOREIGN KEY (data_source_id) REFERENCES data_sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one RUNNING record per data source, across processes.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_run_records_single_flight
        ON run_records(data_source_id) WHERE status = 'RUNNING'
        "#,
    )
    .execute(pool)
    .await?;

    // Create canonical_records table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_records (
            org_id TEXT NOT NULL,
            variant TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            body_json TEXT NOT NULL,
            source_updated_at INTEGER,
            first_seen_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, variant, source_kind, natural_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_run_records_source_started ON run_records(data_source_id, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_canonical_records_updated_at ON canonical_records(org_id, variant, updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
