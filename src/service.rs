//! Long-running engine: scheduler, worker pool and the shared coordinator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::config::Config;
use crate::coordinator::RunCoordinator;
use crate::error::Result;
use crate::hooks::RecordHook;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::worker::{RunQueue, WorkerPool};

pub struct Service {
    coordinator: Arc<RunCoordinator>,
    queue: RunQueue,
    pool: WorkerPool,
    scheduler: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Service {
    /// Start the worker pool and the scheduler loop.
    pub fn start(
        config: &Config,
        store: Arc<dyn Store>,
        hook: Arc<dyn RecordHook>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let coordinator = Arc::new(RunCoordinator::new(config, store, hook, clock)?);
        let (queue, rx) = RunQueue::channel(config.ingest.queue_capacity);
        let pool = WorkerPool::spawn(
            coordinator.clone(),
            &queue,
            rx,
            config.ingest.max_parallel_runs,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            coordinator.clone(),
            queue.clone(),
            Duration::from_secs(config.ingest.tick_secs),
        );
        let scheduler = tokio::spawn(scheduler.run(shutdown_rx));
        info!(workers = pool.size(), "ingestion engine started");

        Ok(Self {
            coordinator,
            queue,
            pool,
            scheduler,
            shutdown,
        })
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    /// Stop scheduling and wait for in-flight runs to finish.
    ///
    /// Queue handles given to the HTTP server must be dropped first or the
    /// workers will keep waiting for requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.scheduler.await {
            tracing::error!(error = %e, "scheduler task failed");
        }
        drop(self.queue);
        self.pool.join().await;
        info!("ingestion engine stopped");
    }
}
