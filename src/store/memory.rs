//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state sits behind one `std::sync::Mutex`, which makes every trait
//! method trivially atomic. Upsert failures can be injected to exercise the
//! persistence error paths.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{PreparedRecord, RunFinish, Store, ABANDONED};
use crate::error::{IngestError, Result};
use crate::models::{
    DataSource, NewDataSource, RecordQuery, RecordVariant, RunCounts, RunRecord, RunStatus,
    RunTrigger, SourceKind, StoredRecord, UpsertOutcome,
};

type RecordKey = (String, RecordVariant, SourceKind, String);

#[derive(Default)]
struct Inner {
    sources: Vec<DataSource>,
    runs: Vec<RunRecord>,
    records: BTreeMap<RecordKey, StoredRecord>,
    /// Remaining injected upsert failures and whether they are transient.
    failures: Option<(usize, bool)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` calls to `upsert_batch` fail.
    pub fn fail_next_upserts(&self, count: usize, transient: bool) {
        self.lock().failures = (count > 0).then_some((count, transient));
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }
}

impl Inner {
    fn source_mut(&mut self, id: &str) -> Result<&mut DataSource> {
        self.sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| IngestError::NotFound(format!("data source {}", id)))
    }

    fn abandon_stale(&mut self, source_id: Option<&str>, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> Vec<String> {
        let mut reaped = Vec::new();
        for run in self.runs.iter_mut() {
            if run.status == RunStatus::Running
                && run.started_at < stale_before
                && source_id.map_or(true, |id| run.data_source_id == id)
            {
                run.status = RunStatus::Failed;
                run.ended_at = Some(now);
                run.error = Some(ABANDONED.to_string());
                reaped.push(run.data_source_id.clone());
            }
        }
        for id in &reaped {
            if let Some(source) = self.sources.iter_mut().find(|s| &s.id == id) {
                source.last_status = Some(RunStatus::Failed);
            }
        }
        reaped
    }

    fn runs_newest_first(&self, source_id: &str) -> impl Iterator<Item = &RunRecord> {
        let source_id = source_id.to_string();
        self.runs
            .iter()
            .rev()
            .filter(move |r| r.data_source_id == source_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_source(&self, new: NewDataSource, now: DateTime<Utc>) -> Result<DataSource> {
        let mut inner = self.lock();
        if inner
            .sources
            .iter()
            .any(|s| s.org_id == new.org_id && s.kind == new.kind)
        {
            return Err(IngestError::Conflict(format!(
                "a {} data source already exists for org {}",
                new.kind, new.org_id
            )));
        }
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
        inner.sources.push(source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.lock().sources.iter().find(|s| s.id == id).cloned())
    }

    async fn find_source(&self, org_id: &str, kind: SourceKind) -> Result<Option<DataSource>> {
        Ok(self
            .lock()
            .sources
            .iter()
            .find(|s| s.org_id == org_id && s.kind == kind)
            .cloned())
    }

    async fn list_sources(&self, org_id: &str) -> Result<Vec<DataSource>> {
        let mut sources: Vec<DataSource> = self
            .lock()
            .sources
            .iter()
            .filter(|s| s.org_id == org_id)
            .cloned()
            .collect();
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
        let mut inner = self.lock();
        inner.source_mut(source_id)?;
        inner.abandon_stale(Some(source_id), stale_before, now);

        if inner
            .runs
            .iter()
            .any(|r| r.data_source_id == source_id && r.status == RunStatus::Running)
        {
            return Err(IngestError::LockBusy {
                source_id: source_id.to_string(),
            });
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
        inner.runs.push(run.clone());
        inner.source_mut(source_id)?.last_run_at = Some(now);
        Ok(run)
    }

    async fn finalize_run(&self, run_id: &str, finish: RunFinish) -> Result<RunRecord> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| IngestError::NotFound(format!("run {}", run_id)))?;
        if run.status != RunStatus::Running {
            return Err(IngestError::Conflict(format!(
                "run {} is already finalized as {}",
                run_id, run.status
            )));
        }
        run.status = finish.status;
        run.counts = finish.counts;
        run.error = finish.error;
        run.ended_at = Some(finish.ended_at);
        let run = run.clone();

        let source = inner.source_mut(&run.data_source_id)?;
        source.last_status = Some(finish.status);
        if let Some(cursor) = finish.cursor {
            source.last_success_cursor = Some(cursor);
        }
        Ok(run)
    }

    async fn latest_run(&self, source_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.lock().runs_newest_first(source_id).next().cloned())
    }

    async fn last_finished_run(&self, source_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .lock()
            .runs_newest_first(source_id)
            .find(|r| r.status.is_terminal())
            .cloned())
    }

    async fn list_runs(&self, source_id: &str, limit: i64) -> Result<Vec<RunRecord>> {
        Ok(self
            .lock()
            .runs_newest_first(source_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn reap_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        Ok(self.lock().abandon_stale(None, stale_before, now))
    }

    async fn upsert_batch(
        &self,
        org_id: &str,
        batch: &[PreparedRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>> {
        let mut inner = self.lock();
        if let Some((remaining, transient)) = inner.failures {
            inner.failures = (remaining > 1).then_some((remaining - 1, transient));
            return Err(IngestError::persistence("injected upsert failure", transient));
        }

        // Stage into a copy so a failure part-way leaves nothing behind.
        let mut staged = inner.records.clone();
        let mut outcomes = Vec::with_capacity(batch.len());
        for rec in batch {
            let key = (
                org_id.to_string(),
                rec.variant,
                rec.source_kind,
                rec.natural_key.clone(),
            );
            let outcome = match staged.get_mut(&key) {
                None => {
                    staged.insert(
                        key,
                        StoredRecord {
                            org_id: org_id.to_string(),
                            variant: rec.variant,
                            source_kind: rec.source_kind,
                            natural_key: rec.natural_key.clone(),
                            fingerprint: rec.fingerprint.clone(),
                            body: rec.body.clone(),
                            source_updated_at: rec.source_updated_at,
                            first_seen_at: now,
                            updated_at: now,
                        },
                    );
                    UpsertOutcome::Inserted
                }
                Some(existing) if existing.fingerprint != rec.fingerprint => {
                    existing.fingerprint = rec.fingerprint.clone();
                    existing.body = rec.body.clone();
                    existing.source_updated_at = rec.source_updated_at;
                    existing.updated_at = now;
                    UpsertOutcome::Changed
                }
                Some(_) => UpsertOutcome::Unchanged,
            };
            outcomes.push(outcome);
        }
        inner.records = staged;
        Ok(outcomes)
    }

    async fn list_records(
        &self,
        org_id: &str,
        variant: RecordVariant,
        query: &RecordQuery,
    ) -> Result<Vec<StoredRecord>> {
        let needle = query.text.as_deref().map(str::to_lowercase);
        let mut rows: Vec<StoredRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| r.org_id == org_id && r.variant == variant)
            .filter(|r| query.source_kind.map_or(true, |k| r.source_kind == k))
            .filter(|r| {
                needle.as_deref().map_or(true, |n| {
                    r.natural_key.to_lowercase().contains(n)
                        || r.body.to_string().to_lowercase().contains(n)
                })
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });
        Ok(rows
            .into_iter()
            .skip(query.skip.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }
}
