//! Data source registration and the `sources` / `runs` status tables.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::adapters::SourceSettings;
use crate::config::{Config, SeedSource};
use crate::error::IngestError;
use crate::models::{DataSource, NewDataSource, RunRecord, SourceKind, MAX_INTERVAL_MINUTES};
use crate::store::Store;

/// Registration input shared by the CLI and `POST /datasources`.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub kind: SourceKind,
    pub label: String,
    pub config: Value,
    pub interval_minutes: Option<i64>,
    pub enabled: bool,
}

impl From<&SeedSource> for SourceRequest {
    fn from(seed: &SeedSource) -> Self {
        Self {
            kind: seed.kind,
            label: seed.label.clone(),
            config: seed.config.clone(),
            interval_minutes: seed.interval_minutes,
            enabled: seed.enabled,
        }
    }
}

/// Validate and create a data source for the configured organization.
pub async fn register_source(
    store: &dyn Store,
    config: &Config,
    request: SourceRequest,
    now: DateTime<Utc>,
) -> crate::error::Result<DataSource> {
    let label = request.label.trim();
    if label.is_empty() {
        return Err(IngestError::Invalid("label must not be empty".into()));
    }
    let interval_minutes = request
        .interval_minutes
        .unwrap_or(config.ingest.default_interval_minutes);
    if !(1..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(IngestError::Invalid(format!(
            "interval_minutes must be between 1 and {}",
            MAX_INTERVAL_MINUTES
        )));
    }
    SourceSettings::parse(request.kind, &request.config)?;

    let config_json = match request.config {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let source = store
        .create_source(
            NewDataSource {
                org_id: config.ingest.org_id.clone(),
                kind: request.kind,
                label: label.to_string(),
                enabled: request.enabled,
                config: config_json,
                interval_minutes,
            },
            now,
        )
        .await?;
    info!(kind = %source.kind, id = %source.id, "data source registered");
    Ok(source)
}

/// Create every `[[sources]]` entry that does not exist yet. Returns how
/// many were created.
pub async fn ensure_seeded(
    store: &dyn Store,
    config: &Config,
    now: DateTime<Utc>,
) -> crate::error::Result<usize> {
    let mut created = 0;
    for seed in &config.sources {
        if store
            .find_source(&config.ingest.org_id, seed.kind)
            .await?
            .is_some()
        {
            continue;
        }
        register_source(store, config, SourceRequest::from(seed), now).await?;
        created += 1;
    }
    Ok(created)
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn print_sources(store: &dyn Store, config: &Config) -> Result<()> {
    let sources = store.list_sources(&config.ingest.org_id).await?;
    if sources.is_empty() {
        println!("No data sources configured. Add one with `threatfeed source add`.");
        return Ok(());
    }

    println!(
        "{:<10} {:<28} {:<8} {:<20} {:<13} NEXT DUE",
        "KIND", "LABEL", "ENABLED", "LAST RUN", "STATUS"
    );
    for s in &sources {
        let status = s
            .last_status
            .map(|st| st.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());
        let next = if s.enabled {
            s.next_run_at()
                .map(|t| fmt_time(Some(t)))
                .unwrap_or_else(|| "now".to_string())
        } else {
            "-".to_string()
        };
        println!(
            "{:<10} {:<28} {:<8} {:<20} {:<13} {}",
            s.kind.as_str(),
            truncate(&s.label, 28),
            s.enabled,
            fmt_time(s.last_run_at),
            status,
            next
        );
    }
    Ok(())
}

pub fn print_run(run: &RunRecord) {
    let c = &run.counts;
    println!(
        "run {} {} (fetched {}, normalized {}, parse errors {}, new {}, changed {}, unchanged {}, pages {}/{})",
        run.id,
        run.status,
        c.fetched,
        c.normalized,
        c.parse_errors,
        c.inserted,
        c.changed,
        c.unchanged,
        c.pages_ok,
        c.pages_ok + c.pages_failed
    );
    if let Some(err) = &run.error {
        println!("  error: {}", err);
    }
}

pub fn print_runs(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }
    println!(
        "{:<20} {:<10} {:<13} {:>8} {:>6} {:>8} {:>7}",
        "STARTED", "TRIGGER", "STATUS", "FETCHED", "NEW", "CHANGED", "ERRORS"
    );
    for r in runs {
        println!(
            "{:<20} {:<10} {:<13} {:>8} {:>6} {:>8} {:>7}",
            fmt_time(Some(r.started_at)),
            r.trigger.as_str(),
            r.status.as_str(),
            r.counts.fetched,
            r.counts.inserted,
            r.counts.changed,
            r.counts.parse_errors
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
