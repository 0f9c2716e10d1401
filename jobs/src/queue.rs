use curio_core::model::{derive_job_id, now_ms, sha256_hex, Job, JobEvent, JobKind, JobState};
use serde::Serialize;
use std::sync::Arc;
use storage::registry::{Registry, RegistryError};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("lease lost")]
    LeaseLost,
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("registry error: {0}")]
    Registry(RegistryError),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<RegistryError> for QueueError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict(_) => QueueError::LeaseLost,
            RegistryError::NotFound(id) => QueueError::NotFound(id),
            other => QueueError::Registry(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lease_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
        }
    }
}

/// Durable at-least-once queue layered over the registry's job table. The
/// registry provides atomic claim/lease primitives; this type adds payload
/// encoding, retry backoff, and the dead-letter path.
pub struct JobQueue {
    registry: Arc<Registry>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(registry: Arc<Registry>, config: QueueConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn lease_ms(&self) -> u64 {
        self.config.lease_ms
    }

    /// Enqueue a job. An idempotency key that already names a non-terminal
    /// job returns the existing one instead of inserting.
    pub async fn enqueue<P: Serialize>(
        &self,
        kind: JobKind,
        container_id: &str,
        payload: &P,
        idempotency_key: Option<String>,
        agent_id: Option<String>,
    ) -> Result<Job, QueueError> {
        let payload_json = serde_json::to_string(payload)?;
        let now = now_ms();
        let id_seed = idempotency_key.clone().unwrap_or_else(|| {
            format!("{}:{}:{}", container_id, sha256_hex(payload_json.as_bytes()), now)
        });

        let job = Job {
            id: derive_job_id(kind.as_str(), &id_seed),
            kind,
            container_id: container_id.to_string(),
            payload_json,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            lease_expires_at_ms: None,
            worker_id: None,
            not_before_ms: None,
            last_error: None,
            result_json: None,
            idempotency_key,
            agent_id,
            created_at_ms: now,
            updated_at_ms: now,
        };

        Ok(self.registry.enqueue_job(job).await?)
    }

    pub async fn claim(
        &self,
        worker_id: &str,
        kinds: &[JobKind],
    ) -> Result<Option<Job>, QueueError> {
        Ok(self
            .registry
            .claim_next_job(kinds, worker_id, self.config.lease_ms, now_ms())
            .await?)
    }

    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<(), QueueError> {
        self.registry
            .heartbeat_job(job_id, worker_id, self.config.lease_ms, now_ms())
            .await?;
        Ok(())
    }

    pub async fn complete<R: Serialize>(
        &self,
        job_id: &str,
        worker_id: &str,
        result: &R,
    ) -> Result<Job, QueueError> {
        let result_json = serde_json::to_string(result)?;
        Ok(self
            .registry
            .complete_job(job_id, worker_id, result_json, now_ms())
            .await?)
    }

    /// A retryable failure re-queues with exponential backoff until attempts
    /// run out; everything else is terminal and goes to the dead-letter log.
    pub async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        error_text: &str,
        retryable: bool,
    ) -> Result<Job, QueueError> {
        let job = self
            .registry
            .get_job(job_id)
            .await
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        let now = now_ms();
        let requeue_at = if retryable && job.attempts < job.max_attempts {
            Some(now + backoff_ms(&self.config, job_id, job.attempts) as i64)
        } else {
            None
        };

        let failed = self
            .registry
            .fail_job(job_id, worker_id, error_text.to_string(), requeue_at, now)
            .await?;

        if failed.state == JobState::Failed {
            error!(
                target: "curio::dead_letter",
                job_id = %failed.id,
                kind = failed.kind.as_str(),
                container_id = %failed.container_id,
                attempts = failed.attempts,
                error = error_text,
                "job moved to dead letter"
            );
        }

        Ok(failed)
    }

    /// Re-queue jobs whose lease expired without heartbeats.
    pub async fn reap(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.registry.reap_expired_jobs(now_ms()).await?)
    }

    pub async fn status(&self, ids: &[String]) -> Vec<Job> {
        self.registry.get_jobs(ids).await
    }

    pub async fn events(&self, job_id: &str) -> Vec<JobEvent> {
        self.registry.job_events(job_id).await
    }
}

/// Exponential backoff (base doubling per attempt, capped) with a
/// deterministic ±20% jitter derived from the job id, so retry storms spread
/// without needing a random source.
fn backoff_ms(config: &QueueConfig, job_id: &str, attempts: u32) -> u64 {
    let exponent = attempts.saturating_sub(1).min(16);
    let base = config
        .backoff_base_ms
        .saturating_mul(1u64 << exponent)
        .min(config.backoff_cap_ms);

    let digest = sha256_hex(format!("{}:{}", job_id, attempts).as_bytes());
    let bucket = u64::from_str_radix(&digest[..4], 16).unwrap_or(0) % 401; // 0..=400
    let factor = 0.8 + (bucket as f64) / 1000.0; // 0.8..=1.2
    ((base as f64) * factor) as u64
}
