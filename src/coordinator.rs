//! Run admission and execution for a single data source.
//!
//! [`RunCoordinator::admit`] applies the gates in order: the source must
//! exist and be enabled; no RUNNING record may exist (else `LockBusy`,
//! reported as SKIPPED_BUSY); a manual trigger must be outside the cooldown
//! measured from the previous finalized run (else `RateLimitExceeded`). On
//! acceptance the store opens a RUNNING record atomically.
//!
//! [`RunCoordinator::execute`] drives adapter → executor → normalizer →
//! upsert engine page by page, then finalizes the record exactly once:
//!
//! | Outcome | Status | Cursor |
//! |---------|--------|--------|
//! | every page persisted, no parse errors | SUCCESS | advanced |
//! | every page persisted, some items unparseable | PARTIAL | advanced |
//! | some pages failed or deadline hit, some persisted | PARTIAL | held |
//! | nothing persisted, or a persistence error | FAILED | held |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::adapters::{Adapter, PageRequest, SourceAdapter};
use crate::clock::Clock;
use crate::config::Config;
use crate::cursor::{Cursor, DeltaTracker};
use crate::error::{IngestError, Result};
use crate::fetch::{FetchExecutor, RetryDecision, RetryPolicy};
use crate::hooks::RecordHook;
use crate::models::{
    CanonicalRecord, DataSource, RunCounts, RunRecord, RunStatus, RunTrigger, SourceKind,
};
use crate::normalize::key_hint;
use crate::rate_limiter::{LimiterRegistry, RateLimitConfig};
use crate::store::{RunFinish, Store};
use crate::upsert::UpsertEngine;

/// Gate and lifecycle settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub org_id: String,
    pub manual_cooldown: Duration,
    pub run_timeout: Duration,
    pub stale_after: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            org_id: config.ingest.org_id.clone(),
            manual_cooldown: config.ingest.manual_cooldown(),
            run_timeout: config.ingest.run_timeout(),
            stale_after: config.ingest.stale_after(),
        }
    }
}

/// An accepted run: the RUNNING record plus the source snapshot it runs on.
#[derive(Debug, Clone)]
pub struct Admission {
    pub source: DataSource,
    pub run: RunRecord,
}

pub struct RunCoordinator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    client: reqwest::Client,
    fetch_retry: RetryPolicy,
    rate_limits: HashMap<SourceKind, RateLimitConfig>,
    limiters: LimiterRegistry,
    upserts: UpsertEngine,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl RunCoordinator {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        hook: Arc<dyn RecordHook>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = FetchExecutor::build_client(&config.http)?;
        let rate_limits = SourceKind::ALL
            .into_iter()
            .map(|k| (k, config.rate_limit_for(k)))
            .collect();
        let fetch_retry = config.http.retry_policy();
        Ok(Self {
            upserts: UpsertEngine::new(store.clone(), hook, fetch_retry.clone()),
            store,
            clock,
            settings: CoordinatorSettings::from_config(config),
            client,
            fetch_retry,
            rate_limits,
            limiters: LimiterRegistry::new(),
        })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono_duration(self.settings.stale_after)
    }

    /// Look up the organization's data source of `kind`.
    pub async fn source_for_kind(&self, kind: SourceKind) -> Result<DataSource> {
        self.store
            .find_source(&self.settings.org_id, kind)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("no {} data source configured", kind)))
    }

    /// Admit a run for the organization's source of `kind`.
    pub async fn admit(&self, kind: SourceKind, trigger: RunTrigger) -> Result<Admission> {
        let source = self.source_for_kind(kind).await?;
        self.admit_source(source, trigger).await
    }

    /// Admit a run for a known source.
    #[tracing::instrument(skip_all, fields(kind = %source.kind, trigger = trigger.as_str()))]
    pub async fn admit_source(&self, source: DataSource, trigger: RunTrigger) -> Result<Admission> {
        if !source.enabled {
            return Err(IngestError::Invalid(format!(
                "data source {} ({}) is disabled",
                source.label, source.kind
            )));
        }
        let now = self.clock.now();
        let stale_before = self.stale_before(now);

        // Fast rejection; begin_run stays the authority under races.
        if let Some(latest) = self.store.latest_run(&source.id).await? {
            if latest.status == RunStatus::Running && latest.started_at >= stale_before {
                info!(status = %RunStatus::SkippedBusy, run_id = %latest.id, "run already in progress");
                return Err(IngestError::LockBusy {
                    source_id: source.id.clone(),
                });
            }
        }

        if trigger == RunTrigger::Manual {
            if let Some(last) = self.store.last_finished_run(&source.id).await? {
                let finished = last.ended_at.unwrap_or(last.started_at);
                let ready_at = finished + chrono_duration(self.settings.manual_cooldown);
                if now < ready_at {
                    let retry_after = (ready_at - now).to_std().unwrap_or_default();
                    info!(retry_after_secs = retry_after.as_secs(), "manual run rejected by cooldown");
                    return Err(IngestError::RateLimitExceeded { retry_after });
                }
            }
        }

        let run = match self
            .store
            .begin_run(&source.id, trigger, now, stale_before)
            .await
        {
            Ok(run) => run,
            Err(e @ IngestError::LockBusy { .. }) => {
                info!(status = %RunStatus::SkippedBusy, "run already in progress");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        info!(run_id = %run.id, "run admitted");

        let mut source = source;
        source.last_run_at = Some(now);
        Ok(Admission { source, run })
    }

    /// Admit then execute in the current task.
    pub async fn run_now(&self, kind: SourceKind, trigger: RunTrigger) -> Result<RunRecord> {
        let admission = self.admit(kind, trigger).await?;
        self.execute(admission).await
    }

    /// Finalize an admitted run that will never execute.
    pub async fn abort(&self, admission: &Admission, reason: &str) -> Result<RunRecord> {
        self.finalize(
            &admission.run.id,
            RunFinish {
                status: RunStatus::Failed,
                counts: RunCounts::default(),
                error: Some(reason.to_string()),
                ended_at: self.clock.now(),
                cursor: None,
            },
        )
        .await
    }

    /// Run the pipeline for an admitted run and finalize its record.
    #[tracing::instrument(skip_all, fields(kind = %admission.source.kind, run_id = %admission.run.id))]
    pub async fn execute(&self, admission: Admission) -> Result<RunRecord> {
        let Admission { source, run } = admission;

        let adapter = match Adapter::for_source(source.kind, &source.config) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "source configuration is invalid");
                return self
                    .finalize(
                        &run.id,
                        RunFinish {
                            status: RunStatus::Failed,
                            counts: RunCounts::default(),
                            error: Some(e.to_string()),
                            ended_at: self.clock.now(),
                            cursor: None,
                        },
                    )
                    .await;
            }
        };

        let outcome = self.drive(&source, &run.id, adapter.as_source()).await;
        if outcome.superseded {
            warn!("run was reaped while executing; leaving its record as finalized");
            return Err(IngestError::Conflict(format!(
                "run {} was reaped before it finished",
                run.id
            )));
        }
        let ended_at = self.clock.now();
        let finish = outcome.into_finish(ended_at);
        info!(
            status = %finish.status,
            fetched = finish.counts.fetched,
            normalized = finish.counts.normalized,
            parse_errors = finish.counts.parse_errors,
            inserted = finish.counts.inserted,
            changed = finish.counts.changed,
            unchanged = finish.counts.unchanged,
            pages_failed = finish.counts.pages_failed,
            cursor_advanced = finish.cursor.is_some(),
            "run finished"
        );
        self.finalize(&run.id, finish).await
    }

    async fn finalize(&self, run_id: &str, finish: RunFinish) -> Result<RunRecord> {
        let classify = |e: &IngestError| {
            if e.is_transient_persistence() {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        };
        self.fetch_retry
            .run(classify, |_| self.store.finalize_run(run_id, finish.clone()))
            .await
    }

    /// Whether `run_id` is still the RUNNING record for its source. A run the
    /// reaper finalized must stop before a newer run's pages interleave
    /// with its own. Store errors count as still running.
    async fn still_running(&self, source_id: &str, run_id: &str) -> bool {
        match self.store.latest_run(source_id).await {
            Ok(Some(latest)) => latest.id == run_id && latest.status == RunStatus::Running,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "could not confirm run ownership");
                true
            }
        }
    }

    async fn drive(
        &self,
        source: &DataSource,
        run_id: &str,
        adapter: &dyn SourceAdapter,
    ) -> RunOutcome {
        let mut outcome = RunOutcome::default();

        let committed = match adapter.parse_cursor(source.last_success_cursor.as_deref()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "discarding unreadable cursor");
                Cursor::Empty
            }
        };
        let plan = adapter.plan(&committed, self.clock.now());
        let mut tracker = DeltaTracker::new(committed);

        let limiter = self.limiters.for_source(
            &source.id,
            self.rate_limits
                .get(&source.kind)
                .copied()
                .unwrap_or_else(|| RateLimitConfig::new(1.0, 1)),
        );
        let exec = FetchExecutor::new(self.client.clone(), self.fetch_retry.clone(), limiter);
        let deadline = Instant::now() + self.settings.run_timeout;

        'chains: for chain in &plan.chains {
            let mut next: Option<PageRequest> = Some(chain.clone());
            while let Some(request) = next.take() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    outcome.timed_out = true;
                    break 'chains;
                }
                if !self.still_running(&source.id, run_id).await {
                    outcome.superseded = true;
                    break 'chains;
                }

                let page = match tokio::time::timeout(
                    remaining,
                    adapter.fetch_page(&exec, &plan, &request),
                )
                .await
                {
                    Err(_) => {
                        outcome.timed_out = true;
                        break 'chains;
                    }
                    Ok(Err(e)) => {
                        warn!(chain = %request.chain, error = %e, "page fetch failed");
                        outcome.counts.pages_failed += 1;
                        outcome.last_error = Some(e.to_string());
                        tracker.mark_incomplete();
                        // Later pages in this chain depend on this one.
                        continue 'chains;
                    }
                    Ok(Ok(page)) => page,
                };

                outcome.counts.fetched += page.items.len() as u64;
                let records = self.normalize_items(adapter, &page.items, &mut outcome.counts);
                if !self.still_running(&source.id, run_id).await {
                    outcome.superseded = true;
                    break 'chains;
                }

                match self
                    .upserts
                    .apply(&source.org_id, &records, self.clock.now())
                    .await
                {
                    Ok(summary) => {
                        outcome.counts.inserted += summary.inserted;
                        outcome.counts.changed += summary.changed;
                        outcome.counts.unchanged += summary.unchanged;
                        outcome.counts.pages_ok += 1;
                        tracker.page_persisted(page.cursor);
                    }
                    Err(e) => {
                        warn!(error = %e, "batch failed to persist; stopping run");
                        outcome.counts.pages_failed += 1;
                        outcome.persistence_failed = true;
                        outcome.last_error = Some(e.to_string());
                        tracker.mark_incomplete();
                        break 'chains;
                    }
                }
                next = page.next;
            }
        }

        if outcome.timed_out {
            tracker.mark_incomplete();
            outcome.last_error = Some(format!(
                "run timed out after {}s",
                self.settings.run_timeout.as_secs()
            ));
        }
        outcome.cursor = tracker.finish();
        outcome
    }

    fn normalize_items(
        &self,
        adapter: &dyn SourceAdapter,
        items: &[Value],
        counts: &mut RunCounts,
    ) -> Vec<CanonicalRecord> {
        let mut records = Vec::with_capacity(items.len());
        for (index, raw) in items.iter().enumerate() {
            match adapter.normalize(raw) {
                Ok(record) => {
                    counts.normalized += 1;
                    records.push(record);
                }
                Err(e) => {
                    counts.parse_errors += 1;
                    warn!(
                        index,
                        key = key_hint(raw).unwrap_or("<none>"),
                        reason = %e.reason,
                        "skipping malformed item"
                    );
                }
            }
        }
        records
    }
}

#[derive(Debug, Default)]
struct RunOutcome {
    counts: RunCounts,
    cursor: Option<Cursor>,
    timed_out: bool,
    superseded: bool,
    persistence_failed: bool,
    last_error: Option<String>,
}

impl RunOutcome {
    fn status(&self) -> RunStatus {
        let c = &self.counts;
        if self.persistence_failed || c.pages_ok == 0 {
            RunStatus::Failed
        } else if c.pages_failed > 0 || self.timed_out {
            RunStatus::Partial
        } else if c.parse_errors > 0 {
            if c.normalized > 0 {
                RunStatus::Partial
            } else {
                RunStatus::Failed
            }
        } else {
            RunStatus::Success
        }
    }

    fn into_finish(self, ended_at: DateTime<Utc>) -> RunFinish {
        let status = self.status();
        let error = match status {
            RunStatus::Success => None,
            _ => self.last_error.clone().or_else(|| {
                (self.counts.parse_errors > 0)
                    .then(|| format!("{} items failed to parse", self.counts.parse_errors))
            }),
        };
        let cursor = match status {
            RunStatus::Failed => None,
            _ => self.cursor.map(|c| c.encode()),
        };
        RunFinish {
            status,
            counts: self.counts,
            error,
            ended_at,
            cursor,
        }
    }
}
