//! Bounded run queue and the fixed worker pool that drains it.
//!
//! The scheduler and the admin API push [`RunRequest`]s onto a bounded
//! `mpsc` channel. `max_parallel_runs` workers share the receiver, so the
//! pool size caps how many runs execute at once. Each run executes in its
//! own task; a panic inside it is caught at the join and the run record is
//! finalized as FAILED.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Admission, RunCoordinator};
use crate::error::IngestError;
use crate::models::RunTrigger;

/// Work handed to the pool.
#[derive(Debug)]
pub enum RunRequest {
    /// A due source; admission happens when a worker picks it up.
    Scheduled { source_id: String },
    /// A manual run already admitted by the caller.
    Admitted(Admission),
}

impl RunRequest {
    pub fn source_id(&self) -> &str {
        match self {
            RunRequest::Scheduled { source_id } => source_id,
            RunRequest::Admitted(a) => &a.source.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// A scheduled request for this source is already queued or executing.
    AlreadyPending,
    Full,
    Closed,
}

/// Source ids with a scheduled request queued or executing.
#[derive(Clone, Default)]
struct PendingSet(Arc<Mutex<HashSet<String>>>);

impl PendingSet {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, source_id: &str) -> bool {
        self.lock().insert(source_id.to_string())
    }

    fn remove(&self, source_id: &str) {
        self.lock().remove(source_id);
    }
}

/// Sending half of the run queue.
///
/// Scheduled requests are de-duplicated per source until a worker has
/// finished with them, so a slow run is not queued again on every tick.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::Sender<RunRequest>,
    pending: PendingSet,
}

impl RunQueue {
    pub fn channel(capacity: usize) -> (RunQueue, mpsc::Receiver<RunRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            RunQueue {
                tx,
                pending: PendingSet::default(),
            },
            rx,
        )
    }

    pub fn is_pending(&self, source_id: &str) -> bool {
        self.pending.lock().contains(source_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a scheduled run without waiting.
    pub fn submit_scheduled(&self, source_id: &str) -> SubmitOutcome {
        if !self.pending.insert(source_id) {
            return SubmitOutcome::AlreadyPending;
        }
        let request = RunRequest::Scheduled {
            source_id: source_id.to_string(),
        };
        match self.tx.try_send(request) {
            Ok(()) => SubmitOutcome::Queued,
            Err(e) => {
                self.pending.remove(source_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => SubmitOutcome::Full,
                    mpsc::error::TrySendError::Closed(_) => SubmitOutcome::Closed,
                }
            }
        }
    }

    /// Queue an admitted run, waiting up to `wait` for capacity. Returns
    /// `false` if the queue stayed full or has closed; the caller still owns
    /// the RUNNING record and must finalize it.
    pub async fn submit_admitted(&self, admission: Admission, wait: Duration) -> bool {
        self.tx
            .send_timeout(RunRequest::Admitted(admission), wait)
            .await
            .is_ok()
    }
}

/// Fixed set of worker tasks sharing one receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Workers only keep the queue's pending set, not its sender, so the
    /// channel closes once the scheduler and API handles are dropped.
    pub fn spawn(
        coordinator: Arc<RunCoordinator>,
        queue: &RunQueue,
        rx: mpsc::Receiver<RunRequest>,
        workers: usize,
    ) -> Self {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let coordinator = coordinator.clone();
                let pending = queue.pending.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(request) = next else { break };
                        process(&coordinator, &pending, request).await;
                    }
                    debug!(worker, "run queue closed; worker exiting");
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to drain the queue and exit. The queue closes
    /// once every [`RunQueue`] clone has been dropped.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

async fn process(coordinator: &Arc<RunCoordinator>, pending: &PendingSet, request: RunRequest) {
    let scheduled = matches!(request, RunRequest::Scheduled { .. });
    let source_id = request.source_id().to_string();

    let admission = match request {
        RunRequest::Admitted(admission) => Some(admission),
        RunRequest::Scheduled { source_id } => admit_scheduled(coordinator, &source_id).await,
    };

    if let Some(admission) = admission {
        execute_guarded(coordinator, admission).await;
    }
    if scheduled {
        pending.remove(&source_id);
    }
}

async fn admit_scheduled(coordinator: &RunCoordinator, source_id: &str) -> Option<Admission> {
    let source = match coordinator.store().get_source(source_id).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            warn!(source_id, "scheduled source no longer exists");
            return None;
        }
        Err(e) => {
            warn!(source_id, error = %e, "failed to load scheduled source");
            return None;
        }
    };
    match coordinator.admit_source(source, RunTrigger::Scheduled).await {
        Ok(admission) => Some(admission),
        Err(IngestError::LockBusy { .. }) => None,
        Err(IngestError::Invalid(reason)) => {
            debug!(source_id, %reason, "scheduled run not admitted");
            None
        }
        Err(e) => {
            warn!(source_id, error = %e, "scheduled run not admitted");
            None
        }
    }
}

async fn execute_guarded(coordinator: &Arc<RunCoordinator>, admission: Admission) {
    let task = {
        let coordinator = coordinator.clone();
        let admission = admission.clone();
        tokio::spawn(async move { coordinator.execute(admission).await })
    };
    match task.await {
        Ok(Ok(run)) => {
            debug!(run_id = %run.id, status = %run.status, "worker finished run");
        }
        Ok(Err(e)) => {
            error!(run_id = %admission.run.id, error = %e, "run could not be finalized");
        }
        Err(join_error) => {
            error!(run_id = %admission.run.id, error = %join_error, "run task aborted");
            match coordinator
                .abort(&admission, &format!("run task aborted: {}", join_error))
                .await
            {
                Ok(run) => info!(run_id = %run.id, "aborted run finalized as FAILED"),
                Err(e) => error!(run_id = %admission.run.id, error = %e, "failed to finalize aborted run"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_submissions_deduplicate() {
        let (queue, mut rx) = RunQueue::channel(4);
        assert_eq!(queue.submit_scheduled("s1"), SubmitOutcome::Queued);
        assert_eq!(queue.submit_scheduled("s1"), SubmitOutcome::AlreadyPending);
        assert_eq!(queue.submit_scheduled("s2"), SubmitOutcome::Queued);
        assert_eq!(queue.pending_count(), 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.source_id(), "s1");
        queue.pending.remove("s1");
        assert!(!queue.is_pending("s1"));
        assert_eq!(queue.submit_scheduled("s1"), SubmitOutcome::Queued);
    }

    #[test]
    fn test_full_queue_releases_pending_slot() {
        let (queue, _rx) = RunQueue::channel(1);
        assert_eq!(queue.submit_scheduled("a"), SubmitOutcome::Queued);
        assert_eq!(queue.submit_scheduled("b"), SubmitOutcome::Full);
        assert!(!queue.is_pending("b"));
    }

    #[test]
    fn test_closed_queue() {
        let (queue, rx) = RunQueue::channel(1);
        drop(rx);
        assert_eq!(queue.submit_scheduled("a"), SubmitOutcome::Closed);
    }
}
