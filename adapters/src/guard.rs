use crate::AdapterError;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Opens after N consecutive failures and short-circuits calls with a typed
/// "down" error until the cooldown passes. One breaker per adapter binding.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn check(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap();
        if let Some(open_until) = state.open_until {
            if Instant::now() < open_until {
                return Err(AdapterError::Down(self.name.clone()));
            }
            // Cooldown over: half-open, allow one probe through.
            state.open_until = None;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            tracing::warn!(
                adapter = %self.name,
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
            state.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .open_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Run an adapter call under breaker + deadline. Timeouts and errors count
/// against the breaker; successes close it.
pub async fn guarded<F, T>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    call: F,
) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    breaker.check()?;

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => {
            breaker.record_success();
            Ok(value)
        }
        Ok(Err(err)) => {
            breaker.record_failure();
            Err(err)
        }
        Err(_) => {
            breaker.record_failure();
            Err(AdapterError::Timeout(timeout))
        }
    }
}

/// Token bucket for write-path (ingestion) adapter calls. Retrieval never
/// waits on this; only workers do.
pub struct TokenBucket {
    capacity: f64,
    refill_per_s: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_s: u32) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            refill_per_s: refill_per_s.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: capacity.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_s).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait for a token. Ingestion is pull-based, so an unbounded-ish wait
    /// here just slows the worker loop down.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
