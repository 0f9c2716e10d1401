use crate::queue::{JobQueue, QueueError};
use curio_core::model::{Job, JobKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler outcome for a failed job. `retryable` decides between backoff
/// re-queue and the dead-letter path.
#[derive(Debug)]
pub struct JobFailure {
    pub error: anyhow::Error,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
        }
    }
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, JobFailure>;
}

/// Fixed-size pool of serial claim -> execute -> ack loops, plus a reaper
/// that re-queues jobs whose holder died without heartbeating.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    pool_size: usize,
    claim_interval: Duration,
}

pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, pool_size: usize, claim_interval: Duration) -> Self {
        let pool_size = if pool_size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            pool_size
        };

        Self {
            queue,
            handlers: HashMap::new(),
            pool_size,
            claim_interval,
        }
    }

    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn start(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(self.handlers);
        let kinds: Vec<JobKind> = handlers.keys().copied().collect();
        let mut tasks = Vec::new();

        info!(pool_size = self.pool_size, "starting job worker pool");

        for index in 0..self.pool_size {
            let worker_id = format!("worker-{}", index);
            let queue = self.queue.clone();
            let handlers = handlers.clone();
            let kinds = kinds.clone();
            let mut shutdown = shutdown_rx.clone();
            let claim_interval = self.claim_interval;

            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }

                    match queue.claim(&worker_id, &kinds).await {
                        Ok(Some(job)) => {
                            run_job(&queue, &handlers, &worker_id, job).await;
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(claim_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(err) => {
                            error!(worker_id = %worker_id, "claim failed: {}", err);
                            tokio::time::sleep(claim_interval).await;
                        }
                    }
                }
                debug!(worker_id = %worker_id, "worker stopped");
            }));
        }

        // Reaper sweep at half the lease so an expired job waits at most one
        // extra interval.
        {
            let queue = self.queue.clone();
            let mut shutdown = shutdown_rx;
            let interval = Duration::from_millis((self.queue.lease_ms() / 2).max(100));
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    match queue.reap().await {
                        Ok(reaped) if !reaped.is_empty() => {
                            warn!(count = reaped.len(), "reaped expired job leases");
                        }
                        Ok(_) => {}
                        Err(err) => error!("reap failed: {}", err),
                    }
                }
            }));
        }

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

async fn run_job(
    queue: &Arc<JobQueue>,
    handlers: &Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
    worker_id: &str,
    job: Job,
) {
    let Some(handler) = handlers.get(&job.kind) else {
        // Claimed kinds always have handlers; this guards handler-set drift.
        let _ = queue
            .fail(&job.id, worker_id, "no handler registered", false)
            .await;
        return;
    };

    info!(job_id = %job.id, kind = job.kind.as_str(), worker_id, "executing job");

    // Heartbeat at a third of the lease while the handler runs.
    let heartbeat = {
        let queue = queue.clone();
        let job_id = job.id.clone();
        let worker = worker_id.to_string();
        let interval = Duration::from_millis((queue.lease_ms() / 3).max(50));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match queue.heartbeat(&job_id, &worker).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost) => {
                        warn!(job_id = %job_id, "heartbeat lost lease");
                        break;
                    }
                    Err(err) => {
                        error!(job_id = %job_id, "heartbeat error: {}", err);
                        break;
                    }
                }
            }
        })
    };

    let outcome = handler.execute(&job).await;
    heartbeat.abort();

    match outcome {
        Ok(result) => {
            if let Err(err) = queue.complete(&job.id, worker_id, &result).await {
                error!(job_id = %job.id, "complete failed: {}", err);
            }
        }
        Err(failure) => {
            warn!(
                job_id = %job.id,
                retryable = failure.retryable,
                "job failed: {:#}",
                failure.error
            );
            if let Err(err) = queue
                .fail(
                    &job.id,
                    worker_id,
                    &format!("{:#}", failure.error),
                    failure.retryable,
                )
                .await
            {
                error!(job_id = %job.id, "fail transition error: {}", err);
            }
        }
    }
}
