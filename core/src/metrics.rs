use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct RetrievalMetrics {
    pub total_requests: u64,
    pub partial_responses: u64,
    pub rerank_cache_hits: u64,
    pub rerank_applied: u64,
    pub latencies: VecDeque<u64>, // milliseconds
}

#[derive(Debug, Clone, Default)]
pub struct IngestMetrics {
    pub total_jobs: u64,
    pub chunks_created: u64,
    pub chunks_deduped: u64,
    pub bytes_stored: u64,
}

pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    retrieval: RetrievalMetrics,
    ingest: IngestMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                retrieval: RetrievalMetrics::default(),
                ingest: IngestMetrics::default(),
                max_history,
            })),
        }
    }

    pub fn record_retrieval(
        &self,
        total_ms: u64,
        partial: bool,
        rerank_applied: bool,
        rerank_cache_hit: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        state.retrieval.total_requests += 1;
        if partial {
            state.retrieval.partial_responses += 1;
        }
        if rerank_applied {
            state.retrieval.rerank_applied += 1;
        }
        if rerank_cache_hit {
            state.retrieval.rerank_cache_hits += 1;
        }
        state.retrieval.latencies.push_back(total_ms);
        if state.retrieval.latencies.len() > state.max_history {
            state.retrieval.latencies.pop_front();
        }
    }

    pub fn record_ingest(&self, chunks_created: u64, chunks_deduped: u64, bytes_stored: u64) {
        let mut state = self.state.lock().unwrap();
        state.ingest.total_jobs += 1;
        state.ingest.chunks_created += chunks_created;
        state.ingest.chunks_deduped += chunks_deduped;
        state.ingest.bytes_stored += bytes_stored;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap();
        let r = &state.retrieval;
        let i = &state.ingest;

        let mut sorted: Vec<u64> = r.latencies.iter().copied().collect();
        sorted.sort_unstable();

        MetricsSnapshot {
            total_requests: r.total_requests,
            partial_rate: ratio(r.partial_responses, r.total_requests),
            rerank_cache_hit_rate: ratio(r.rerank_cache_hits, r.rerank_applied),
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            ingest_jobs: i.total_jobs,
            chunks_created: i.chunks_created,
            chunks_deduped: i.chunks_deduped,
            bytes_stored: i.bytes_stored,
        }
    }
}

fn ratio(num: u64, den: u64) -> f32 {
    if den > 0 {
        num as f32 / den as f32
    } else {
        0.0
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub partial_rate: f32,
    pub rerank_cache_hit_rate: f32,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub ingest_jobs: u64,
    pub chunks_created: u64,
    pub chunks_deduped: u64,
    pub bytes_stored: u64,
}
