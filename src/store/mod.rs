//! Storage abstraction for the ingestion engine.
//!
//! The [`Store`] trait covers the three persisted entities: data sources,
//! run records, and canonical records. [`SqliteStore`] is the production
//! backend; [`MemoryStore`] backs tests and embedded use.
//!
//! # Guarantees implementations must provide
//!
//! | Method | Guarantee |
//! |--------|-----------|
//! | [`begin_run`](Store::begin_run) | atomic: reaps a stale RUNNING record, then fails with `LockBusy` if another RUNNING record remains |
//! | [`finalize_run`](Store::finalize_run) | exactly once; status, counts, source status and cursor commit together |
//! | [`upsert_batch`](Store::upsert_batch) | all-or-nothing per batch; unchanged fingerprints cause no write |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    CanonicalRecord, DataSource, NewDataSource, RecordQuery, RecordVariant, RunCounts, RunRecord,
    RunStatus, RunTrigger, SourceKind, StoredRecord, UpsertOutcome,
};
use crate::normalize;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Error text recorded on runs finalized by the stale-run reaper.
pub const ABANDONED: &str = "abandoned";

/// A canonical record ready to write: key, fingerprint and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRecord {
    pub variant: RecordVariant,
    pub source_kind: SourceKind,
    pub natural_key: String,
    pub fingerprint: String,
    pub body: serde_json::Value,
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl PreparedRecord {
    pub fn from_canonical(record: &CanonicalRecord) -> Result<Self> {
        let provenance = record.provenance();
        Ok(Self {
            variant: record.variant(),
            source_kind: provenance.source_kind,
            natural_key: record.natural_key().to_string(),
            fingerprint: normalize::fingerprint(record),
            body: serde_json::to_value(record)?,
            source_updated_at: provenance.source_updated_at,
        })
    }
}

/// Terminal state written by [`Store::finalize_run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinish {
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error: Option<String>,
    pub ended_at: DateTime<Utc>,
    /// New `last_success_cursor`, committed in the same transaction.
    pub cursor: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Register a data source. `Conflict` if the org already has one of
    /// that kind.
    async fn create_source(&self, new: NewDataSource, now: DateTime<Utc>) -> Result<DataSource>;

    async fn get_source(&self, id: &str) -> Result<Option<DataSource>>;

    async fn find_source(&self, org_id: &str, kind: SourceKind) -> Result<Option<DataSource>>;

    /// All data sources of an organization, ordered by kind.
    async fn list_sources(&self, org_id: &str) -> Result<Vec<DataSource>>;

    /// Open a RUNNING record and stamp `last_run_at = now` on the source.
    ///
    /// A RUNNING record started before `stale_before` is first finalized
    /// as FAILED with error [`ABANDONED`].
    async fn begin_run(
        &self,
        source_id: &str,
        trigger: RunTrigger,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<RunRecord>;

    /// Finalize a RUNNING record. `Conflict` if it was already finalized.
    async fn finalize_run(&self, run_id: &str, finish: RunFinish) -> Result<RunRecord>;

    /// Most recent run of any status.
    async fn latest_run(&self, source_id: &str) -> Result<Option<RunRecord>>;

    /// Most recent finalized run (not RUNNING).
    async fn last_finished_run(&self, source_id: &str) -> Result<Option<RunRecord>>;

    /// Run history, newest first.
    async fn list_runs(&self, source_id: &str, limit: i64) -> Result<Vec<RunRecord>>;

    /// Finalize every RUNNING record started before `stale_before` as
    /// abandoned. Returns the affected data source ids.
    async fn reap_stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Apply a batch of records in one transaction.
    async fn upsert_batch(
        &self,
        org_id: &str,
        batch: &[PreparedRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>>;

    /// Stored records of one variant, most recently updated first.
    async fn list_records(
        &self,
        org_id: &str,
        variant: RecordVariant,
        query: &RecordQuery,
    ) -> Result<Vec<StoredRecord>>;
}
