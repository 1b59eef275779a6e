//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch.
//! Single-flight across processes rests on the partial unique index
//! `idx_run_records_single_flight`; a second RUNNING insert for the same
//! source violates it and surfaces as [`IngestError::LockBusy`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{PreparedRecord, RunFinish, Store, ABANDONED};
use crate::error::{IngestError, Result};
use crate::models::{
    DataSource, NewDataSource, RecordQuery, RecordVariant, RunCounts, RunRecord, RunStatus,
    RunTrigger, SourceKind, StoredRecord, UpsertOutcome,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn decode<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|e: String| IngestError::persistence(format!("corrupt row: {}", e), false))
}

fn map_source(row: &SqliteRow) -> Result<DataSource> {
    let kind: String = row.try_get("kind")?;
    let config: String = row.try_get("config_json")?;
    let last_status: Option<String> = row.try_get("last_status")?;
    Ok(DataSource {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        kind: decode(&kind)?,
        label: row.try_get("label")?,
        enabled: row.try_get("enabled")?,
        config: serde_json::from_str(&config)?,
        interval_minutes: row.try_get("interval_minutes")?,
        last_run_at: row.try_get::<Option<i64>, _>("last_run_at")?.map(from_ms),
        last_success_cursor: row.try_get("last_success_cursor")?,
        last_status: last_status.as_deref().map(decode).transpose()?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

fn map_run(row: &SqliteRow) -> Result<RunRecord> {
    let trigger: String = row.try_get("run_trigger")?;
    let status: String = row.try_get("status")?;
    let counts: String = row.try_get("counts_json")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        data_source_id: row.try_get("data_source_id")?,
        trigger: decode(&trigger)?,
        started_at: from_ms(row.try_get("started_at")?),
        ended_at: row.try_get::<Option<i64>, _>("ended_at")?.map(from_ms),
        status: decode(&status)?,
        counts: serde_json::from_str::<RunCounts>(&counts)?,
        error: row.try_get("error")?,
    })
}

fn map_record(row: &SqliteRow) -> Result<StoredRecord> {
    let variant: String = row.try_get("variant")?;
    let source_kind: String = row.try_get("source_kind")?;
    let body: String = row.try_get("body_json")?;
    Ok(StoredRecord {
        org_id: row.try_get("org_id")?,
        variant: decode(&variant)?,
        source_kind: decode(&source_kind)?,
        natural_key: row.try_get("natural_key")?,
        fingerprint: row.try_get("fingerprint")?,
        body: serde_json::from_str(&body)?,
        source_updated_at: row
            .try_get::<Option<i64>, _>("source_updated_at")?
            .map(from_ms),
        first_seen_at: from_ms(row.try_get("first_seen_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

const RUN_COLUMNS: &str =
    "id, data_source_id, run_trigger, started_at, ended_at, status, counts_json, error";

#[async_trait]
impl Store for SqliteStore {
    async fn create_source(&self, new: NewDataSource, now: DateTime<Utc>) -> Result<DataSource> {
        let source = DataSource {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: new.org_id,
            kind: new.kind,
            label: new.label,
            enabled: new.enabled,
            config: new.config,
            interval_minutes: new.interval_minutes,
            last_run_at: None,
            last_success_cursor: None,
            last_status: None,
            created_at: now,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO data_sources (id, org_id, kind, label, enabled, config_json,
                                      interval_minutes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.org_id)
        .bind(source.kind.as_str())
        .bind(&source.label)
        .bind(source.enabled)
        .bind(source.config.to_string())
        .bind(source.interval_minutes)
        .bind(to_ms(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(source),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(IngestError::Conflict(format!(
                    "a {} data source already exists for org {}",
                    source.kind, source.org_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_source(&self, id: &str) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_source).transpose()
    }

    async fn find_source(&self, org_id: &str, kind: SourceKind) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE org_id = ? AND kind = ?")
            .bind(org_id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_source).transpose()
    }

    async fn list_sources(&self, org_id: &str) -> Result<Vec<DataSource>> {
        let rows = sqlx::query("SELECT * FROM data_sources WHERE org_id = ?")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        let mut sources = rows.iter().map(map_source).collect::<Result<Vec<_>>>()?;
        sources.sort_by_key(|s| s.kind);
        Ok(sources)
    }

    async fn begin_run(
        &self,
        source_id: &str,
        trigger: RunTrigger,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock up front.
        let touched = sqlx::query("UPDATE data_sources SET last_run_at = ? WHERE id = ?")
            .bind(to_ms(now))
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(IngestError::NotFound(format!("data source {}", source_id)));
        }

        let reaped = sqlx::query(
            r#"
            UPDATE run_records SET status = 'FAILED', ended_at = ?, error = ?
            WHERE data_source_id = ? AND status = 'RUNNING' AND started_at < ?
            "#,
        )
        .bind(to_ms(now))
        .bind(ABANDONED)
        .bind(source_id)
        .bind(to_ms(stale_before))
        .execute(&mut *tx)
        .await?;
        if reaped.rows_affected() > 0 {
            tracing::warn!(source_id, "reaped abandoned run");
            sqlx::query("UPDATE data_sources SET last_status = 'FAILED' WHERE id = ?")
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
        }

        let run = RunRecord {
            id: uuid::Uuid::new_v4().to_string(),
            data_source_id: source_id.to_string(),
            trigger,
            started_at: now,
            ended_at: None,
            status: RunStatus::Running,
            counts: RunCounts::default(),
            error: None,
        };
        let inserted = sqlx::query(
            r#"
            INSERT INTO run_records (id, data_source_id, run_trigger, started_at, status, counts_json)
            VALUES (?, ?, ?, ?, 'RUNNING', ?)
            "#,
        )
        .bind(&run.id)
        .bind(source_id)
        .bind(trigger.as_str())
        .bind(to_ms(now))
        .bind(serde_json::to_string(&run.counts)?)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(IngestError::LockBusy {
                    source_id: source_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(run)
    }

    async fn finalize_run(&self, run_id: &str, finish: RunFinish) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE run_records SET status = ?, counts_json = ?, error = ?, ended_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(finish.status.as_str())
        .bind(serde_json::to_string(&finish.counts)?)
        .bind(&finish.error)
        .bind(to_ms(finish.ended_at))
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("SELECT {} FROM run_records WHERE id = ?", RUN_COLUMNS))
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;
        let run = match row {
            None => return Err(IngestError::NotFound(format!("run {}", run_id))),
            Some(row) => map_run(&row)?,
        };
        if updated.rows_affected() == 0 {
            return Err(IngestError::Conflict(format!(
                "run {} is already finalized as {}",
                run_id, run.status
            )));
        }

        sqlx::query(
            r#"
            UPDATE data_sources
            SET last_status = ?, last_success_cursor = COALESCE(?, last_success_cursor)
            WHERE id = ?
            "#,
        )
        .bind(finish.status.as_str())
        .bind(&finish.cursor)
        .bind(&run.data_source_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run)
    }

    async fn latest_run(&self, source_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM run_records WHERE data_source_id = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_run).transpose()
    }

    async fn last_finished_run(&self, source_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM run_records WHERE data_source_id = ? AND status != 'RUNNING' ORDER BY started_at DESC, rowid DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_run).transpose()
    }

    async fn list_runs(&self, source_id: &str, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM run_records WHERE data_source_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(source_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_run).collect()
    }

    async fn reap_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let source_ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE run_records SET status = 'FAILED', ended_at = ?, error = ?
            WHERE status = 'RUNNING' AND started_at < ?
            RETURNING data_source_id
            "#,
        )
        .bind(to_ms(now))
        .bind(ABANDONED)
        .bind(to_ms(stale_before))
        .fetch_all(&mut *tx)
        .await?;

        for id in &source_ids {
            sqlx::query("UPDATE data_sources SET last_status = 'FAILED' WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(source_ids)
    }

    async fn upsert_batch(
        &self,
        org_id: &str,
        batch: &[PreparedRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(batch.len());

        for rec in batch {
            let existing: Option<String> = sqlx::query_scalar(
                r#"
                SELECT fingerprint FROM canonical_records
                WHERE org_id = ? AND variant = ? AND source_kind = ? AND natural_key = ?
                "#,
            )
            .bind(org_id)
            .bind(rec.variant.as_str())
            .bind(rec.source_kind.as_str())
            .bind(&rec.natural_key)
            .fetch_optional(&mut *tx)
            .await?;

            let outcome = match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO canonical_records (org_id, variant, source_kind, natural_key,
                                                       fingerprint, body_json, source_updated_at,
                                                       first_seen_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(org_id)
                    .bind(rec.variant.as_str())
                    .bind(rec.source_kind.as_str())
                    .bind(&rec.natural_key)
                    .bind(&rec.fingerprint)
                    .bind(rec.body.to_string())
                    .bind(rec.source_updated_at.map(to_ms))
                    .bind(to_ms(now))
                    .bind(to_ms(now))
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Inserted
                }
                Some(fp) if fp != rec.fingerprint => {
                    sqlx::query(
                        r#"
                        UPDATE canonical_records
                        SET fingerprint = ?, body_json = ?, source_updated_at = ?, updated_at = ?
                        WHERE org_id = ? AND variant = ? AND source_kind = ? AND natural_key = ?
                        "#,
                    )
                    .bind(&rec.fingerprint)
                    .bind(rec.body.to_string())
                    .bind(rec.source_updated_at.map(to_ms))
                    .bind(to_ms(now))
                    .bind(org_id)
                    .bind(rec.variant.as_str())
                    .bind(rec.source_kind.as_str())
                    .bind(&rec.natural_key)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Changed
                }
                Some(_) => UpsertOutcome::Unchanged,
            };
            outcomes.push(outcome);
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn list_records(
        &self,
        org_id: &str,
        variant: RecordVariant,
        query: &RecordQuery,
    ) -> Result<Vec<StoredRecord>> {
        let mut sql = String::from("SELECT * FROM canonical_records WHERE org_id = ? AND variant = ?");
        if query.source_kind.is_some() {
            sql.push_str(" AND source_kind = ?");
        }
        let pattern = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| format!("%{}%", t));
        if pattern.is_some() {
            sql.push_str(" AND (natural_key LIKE ? OR body_json LIKE ?)");
        }
        sql.push_str(" ORDER BY updated_at DESC, natural_key ASC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql).bind(org_id).bind(variant.as_str());
        if let Some(kind) = query.source_kind {
            q = q.bind(kind.as_str());
        }
        if let Some(p) = &pattern {
            q = q.bind(p.clone()).bind(p.clone());
        }
        let rows = q
            .bind(query.limit.max(0))
            .bind(query.skip.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("t.sqlite"));
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::migrate(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn new_source(kind: SourceKind) -> NewDataSource {
        NewDataSource {
            org_id: "org".into(),
            kind,
            label: "label".into(),
            enabled: true,
            config: json!({"feed_url": "https://example.com/rss"}),
            interval_minutes: 60,
        }
    }

    #[tokio::test]
    async fn test_source_roundtrip_and_conflict() {
        let (_tmp, store) = store().await;
        let now = DateTime::from_timestamp_millis(1_717_000_000_123).unwrap();
        let created = store.create_source(new_source(SourceKind::Rss), now).await.unwrap();
        let fetched = store.get_source(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(matches!(
            store.create_source(new_source(SourceKind::Rss), now).await,
            Err(IngestError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_index_blocks_second_running() {
        let (_tmp, store) = store().await;
        let now = Utc::now();
        let ds = store.create_source(new_source(SourceKind::Rss), now).await.unwrap();
        let stale = now - Duration::hours(2);
        let run = store.begin_run(&ds.id, RunTrigger::Manual, now, stale).await.unwrap();
        assert!(matches!(
            store.begin_run(&ds.id, RunTrigger::Manual, now, stale).await,
            Err(IngestError::LockBusy { .. })
        ));

        let finish = RunFinish {
            status: RunStatus::Success,
            counts: RunCounts {
                fetched: 3,
                ..Default::default()
            },
            error: None,
            ended_at: now,
            cursor: Some("{\"type\":\"empty\"}".into()),
        };
        let done = store.finalize_run(&run.id, finish.clone()).await.unwrap();
        assert_eq!(done.counts.fetched, 3);
        assert!(matches!(
            store.finalize_run(&run.id, finish).await,
            Err(IngestError::Conflict(_))
        ));
        store.begin_run(&ds.id, RunTrigger::Manual, now, stale).await.unwrap();
    }

    #[tokio::test]
    async fn test_reaper_returns_sources() {
        let (_tmp, store) = store().await;
        let t0 = Utc::now() - Duration::hours(5);
        let ds = store.create_source(new_source(SourceKind::Rss), t0).await.unwrap();
        store
            .begin_run(&ds.id, RunTrigger::Scheduled, t0, t0 - Duration::hours(2))
            .await
            .unwrap();
        let now = Utc::now();
        let reaped = store.reap_stale_runs(now - Duration::hours(2), now).await.unwrap();
        assert_eq!(reaped, vec![ds.id.clone()]);
        let last = store.last_finished_run(&ds.id).await.unwrap().unwrap();
        assert_eq!(last.error.as_deref(), Some(ABANDONED));
        assert_eq!(
            store.get_source(&ds.id).await.unwrap().unwrap().last_status,
            Some(RunStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_upsert_and_list_records() {
        let (_tmp, store) = store().await;
        let rec = |key: &str, fp: &str| PreparedRecord {
            variant: RecordVariant::Cve,
            source_kind: SourceKind::Nvd,
            natural_key: key.into(),
            fingerprint: fp.into(),
            body: json!({"cve_id": key, "description": "heap overflow"}),
            source_updated_at: None,
        };
        let now = Utc::now();
        let out = store
            .upsert_batch("org", &[rec("CVE-2024-0001", "a"), rec("CVE-2024-0002", "a")], now)
            .await
            .unwrap();
        assert_eq!(out, vec![UpsertOutcome::Inserted; 2]);
        let out = store
            .upsert_batch("org", &[rec("CVE-2024-0001", "a"), rec("CVE-2024-0002", "b")], now)
            .await
            .unwrap();
        assert_eq!(out, vec![UpsertOutcome::Unchanged, UpsertOutcome::Changed]);

        let query = RecordQuery {
            text: Some("0002".into()),
            limit: 10,
            ..Default::default()
        };
        let rows = store.list_records("org", RecordVariant::Cve, &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fingerprint, "b");
    }
}
