//! Core data models used throughout the ingestion engine.
//!
//! These types describe the configured feeds ([`DataSource`]), the history of
//! their executions ([`RunRecord`]), and the normalized output
//! ([`CanonicalRecord`]) that downstream consumers read.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The upstream feed family a [`DataSource`] pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    Nvd,
    Osv,
    Ghsa,
    CisaKev,
    Rss,
    Msrc,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Nvd,
        SourceKind::Osv,
        SourceKind::Ghsa,
        SourceKind::CisaKev,
        SourceKind::Rss,
        SourceKind::Msrc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Nvd => "NVD",
            SourceKind::Osv => "OSV",
            SourceKind::Ghsa => "GHSA",
            SourceKind::CisaKev => "CISA_KEV",
            SourceKind::Rss => "RSS",
            SourceKind::Msrc => "MSRC",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('-', "_");
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == upper)
            .ok_or_else(|| {
                format!(
                    "unknown source kind '{}'. Must be one of: NVD, OSV, GHSA, CISA_KEV, RSS, MSRC",
                    s
                )
            })
    }
}

/// Lifecycle status of a [`RunRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    SkippedBusy,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
            RunStatus::SkippedBusy => "SKIPPED_BUSY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "PARTIAL" => Ok(RunStatus::Partial),
            "FAILED" => Ok(RunStatus::Failed),
            "SKIPPED_BUSY" => Ok(RunStatus::SkippedBusy),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// What caused a run to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            other => Err(format!("unknown run trigger '{}'", other)),
        }
    }
}

/// A configured feed for one organization.
///
/// Only the run coordinator mutates `last_run_at`, `last_success_cursor`
/// and `last_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSource {
    pub id: String,
    pub org_id: String,
    pub kind: SourceKind,
    pub label: String,
    pub enabled: bool,
    /// Opaque per-kind settings, validated by [`crate::adapters::SourceSettings`].
    pub config: serde_json::Value,
    pub interval_minutes: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_cursor: Option<String>,
    pub last_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
}

impl DataSource {
    /// `last_run_at + interval`. `None` when the source has never run, or
    /// when the sum does not fit in a timestamp.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        let interval = Duration::try_minutes(self.interval_minutes)?;
        self.last_run_at?.checked_add_signed(interval)
    }

    /// A never-run source is due immediately. An interval that overflows
    /// the calendar is never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run_at {
            None => true,
            Some(_) => self.next_run_at().is_some_and(|next| next <= now),
        }
    }
}

/// Upper bound for `interval_minutes` (one year).
pub const MAX_INTERVAL_MINUTES: i64 = 525_600;

/// Input for registering a [`DataSource`].
#[derive(Debug, Clone)]
pub struct NewDataSource {
    pub org_id: String,
    pub kind: SourceKind,
    pub label: String,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub interval_minutes: i64,
}

/// Item and page counters accumulated during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub normalized: u64,
    pub parse_errors: u64,
    pub inserted: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub pages_ok: u64,
    pub pages_failed: u64,
}

impl RunCounts {
    /// Records actually written (new + changed).
    pub fn upserted(&self) -> u64 {
        self.inserted + self.changed
    }
}

/// One execution attempt for a [`DataSource`]. Append-only; finalized once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub data_source_id: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error: Option<String>,
}

/// Which canonical table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordVariant {
    Cve,
    Osv,
    Advisory,
}

impl RecordVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordVariant::Cve => "cve",
            RecordVariant::Osv => "osv",
            RecordVariant::Advisory => "advisory",
        }
    }
}

impl fmt::Display for RecordVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cve" | "cves" => Ok(RecordVariant::Cve),
            "osv" | "osv_vulns" => Ok(RecordVariant::Osv),
            "advisory" | "advisories" => Ok(RecordVariant::Advisory),
            other => Err(format!(
                "unknown record variant '{}'. Must be cve, osv, or advisory",
                other
            )),
        }
    }
}

/// Where a canonical record came from. Excluded from the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_kind: SourceKind,
    pub source_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
    pub cve_id: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub cvss_score: Option<f64>,
    pub cvss_severity: Option<String>,
    pub cwes: Vec<String>,
    pub cpes: Vec<String>,
    pub references: Vec<String>,
    pub is_kev: bool,
    pub kev: Option<KevDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KevDetails {
    pub vendor_project: Option<String>,
    pub product: Option<String>,
    pub vulnerability_name: Option<String>,
    pub date_added: Option<String>,
    pub required_action: Option<String>,
    pub due_date: Option<String>,
    pub known_ransomware_use: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsvRecord {
    pub osv_id: String,
    pub aliases: Vec<String>,
    pub summary: Option<String>,
    pub details: Option<String>,
    pub ecosystem: Option<String>,
    pub package: Option<String>,
    pub affected_packages: Vec<String>,
    pub severity: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRecord {
    pub guid: String,
    pub feed: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Normalized entity keyed by a natural key unique within an organization
/// (per source kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Cve {
        #[serde(flatten)]
        record: CveRecord,
        provenance: Provenance,
    },
    Osv {
        #[serde(flatten)]
        record: OsvRecord,
        provenance: Provenance,
    },
    Advisory {
        #[serde(flatten)]
        record: AdvisoryRecord,
        provenance: Provenance,
    },
}

impl CanonicalRecord {
    pub fn variant(&self) -> RecordVariant {
        match self {
            CanonicalRecord::Cve { .. } => RecordVariant::Cve,
            CanonicalRecord::Osv { .. } => RecordVariant::Osv,
            CanonicalRecord::Advisory { .. } => RecordVariant::Advisory,
        }
    }

    pub fn natural_key(&self) -> &str {
        match self {
            CanonicalRecord::Cve { record, .. } => &record.cve_id,
            CanonicalRecord::Osv { record, .. } => &record.osv_id,
            CanonicalRecord::Advisory { record, .. } => &record.guid,
        }
    }

    pub fn provenance(&self) -> &Provenance {
        match self {
            CanonicalRecord::Cve { provenance, .. }
            | CanonicalRecord::Osv { provenance, .. }
            | CanonicalRecord::Advisory { provenance, .. } => provenance,
        }
    }
}

/// Result of applying one canonical record to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Changed,
    Unchanged,
}

/// A canonical record as persisted, for the read API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub org_id: String,
    pub variant: RecordVariant,
    pub source_kind: SourceKind,
    pub natural_key: String,
    pub fingerprint: String,
    pub body: serde_json::Value,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for listing stored records.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub text: Option<String>,
    pub source_kind: Option<SourceKind>,
    pub skip: i64,
    pub limit: i64,
}
