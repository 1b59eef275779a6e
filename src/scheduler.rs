//! Periodic driver that turns due data sources into run requests.
//!
//! The scheduler keeps no state of its own: whether a source is due is
//! derived from its persisted `last_run_at` and interval, so a restarted
//! process resumes exactly where the previous one stopped. Each tick also
//! reaps RUNNING records older than the stale threshold and re-enqueues the
//! affected sources.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::RunCoordinator;
use crate::error::Result;
use crate::worker::{RunQueue, SubmitOutcome};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub due: usize,
    pub enqueued: usize,
    pub already_pending: usize,
    pub queue_full: usize,
}

pub struct Scheduler {
    coordinator: Arc<RunCoordinator>,
    queue: RunQueue,
    period: Duration,
}

impl Scheduler {
    pub fn new(coordinator: Arc<RunCoordinator>, queue: RunQueue, period: Duration) -> Self {
        Self {
            coordinator,
            queue,
            period,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn tick(&self) -> Result<TickReport> {
        let store = self.coordinator.store();
        let now = self.coordinator.now();
        let mut report = TickReport::default();

        let reaped = store
            .reap_stale_runs(self.coordinator.stale_before(now), now)
            .await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "reaped abandoned runs");
        }
        report.reaped = reaped.len();

        let org_id = &self.coordinator.settings().org_id;
        for source in store.list_sources(org_id).await? {
            if !source.enabled {
                continue;
            }
            if !source.is_due(now) && !reaped.contains(&source.id) {
                continue;
            }
            report.due += 1;
            match self.queue.submit_scheduled(&source.id) {
                SubmitOutcome::Queued => {
                    debug!(kind = %source.kind, "enqueued scheduled run");
                    report.enqueued += 1;
                }
                SubmitOutcome::AlreadyPending => report.already_pending += 1,
                SubmitOutcome::Full => {
                    warn!(kind = %source.kind, "run queue full; retrying next tick");
                    report.queue_full += 1;
                }
                SubmitOutcome::Closed => {
                    warn!("run queue closed; stopping tick");
                    break;
                }
            }
        }
        if report.enqueued > 0 {
            info!(due = report.due, enqueued = report.enqueued, "scheduler tick");
        }
        Ok(report)
    }

    /// Tick every `period` until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = self.period.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
