use crate::diagnostics::CacheStatus;
use adapters::rerank::{RerankCandidate, Reranker};
use adapters::AdapterError;
use curio_core::error::IssueCode;
use curio_core::manifest::{RerankPolicy, MAX_RERANK_TOP_K_IN};
use curio_core::model::{now_ms, sha256_hex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::registry::Registry;
use tracing::{debug, warn};

/// Margin kept for rendering after the rerank call.
const RERANK_BUDGET_FLOOR_MS: u64 = 100;

#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
    /// Chunk ids of the reranked prefix in their new order; None when rerank
    /// did not run and the fused order stands.
    pub new_order: Option<Vec<String>>,
    pub cache: Option<CacheStatus>,
    pub issues: Vec<IssueCode>,
    pub elapsed_ms: u64,
    pub applied: bool,
}

/// Budget-guarded second-pass rerank. Never errors the request: timeouts and
/// provider failures keep the fused order and surface as issue codes.
pub async fn rerank_candidates(
    registry: &Registry,
    reranker: Option<&Arc<dyn Reranker>>,
    policy: &RerankPolicy,
    query: &str,
    candidates: &[RerankCandidate],
    k: usize,
    remaining_budget_ms: u64,
) -> RerankOutcome {
    let mut outcome = RerankOutcome::default();

    let top_k_in = (policy.top_k_in as usize)
        .min(MAX_RERANK_TOP_K_IN)
        .min(2 * k)
        .min(candidates.len());
    if top_k_in == 0 {
        return outcome;
    }
    let window = &candidates[..top_k_in];

    if remaining_budget_ms <= RERANK_BUDGET_FLOOR_MS {
        outcome.issues.push(IssueCode::RerankSkippedBudget);
        return outcome;
    }
    let timeout_ms = policy
        .timeout_ms
        .min(remaining_budget_ms - RERANK_BUDGET_FLOOR_MS);
    if timeout_ms == 0 {
        outcome.issues.push(IssueCode::RerankSkippedBudget);
        return outcome;
    }

    let started = Instant::now();
    let cache_key = fingerprint(query, window, &policy.provider, &policy.model);

    if let Some(scores) = registry.rerank_cache_get(&cache_key, now_ms()).await {
        if scores.len() == window.len() {
            outcome.new_order = Some(order_by_scores(window, &scores));
            outcome.cache = Some(CacheStatus::Hit);
            outcome.applied = true;
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            debug!("rerank served from cache");
            return outcome;
        }
    }

    let Some(reranker) = reranker else {
        // Policy enables rerank but no provider is bound.
        outcome.issues.push(IssueCode::RerankDown);
        return outcome;
    };

    let call = reranker.rerank(query, window);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
        Ok(Ok(scores)) if scores.len() == window.len() => {
            // Best-effort cache write with the policy TTL.
            let _ = registry
                .rerank_cache_put(cache_key, scores.clone(), policy.cache_ttl_s, now_ms())
                .await;
            outcome.new_order = Some(order_by_scores(window, &scores));
            outcome.cache = Some(CacheStatus::Miss);
            outcome.applied = true;
        }
        Ok(Ok(scores)) => {
            warn!(
                expected = window.len(),
                got = scores.len(),
                "reranker returned malformed scores, keeping fused order"
            );
            outcome.issues.push(IssueCode::RerankDown);
        }
        Ok(Err(AdapterError::Down(_))) => {
            outcome.issues.push(IssueCode::RerankDown);
        }
        Ok(Err(AdapterError::Timeout(_))) | Err(_) => {
            outcome.issues.push(IssueCode::RerankTimeout);
        }
        Ok(Err(err)) => {
            warn!("rerank provider failed: {}", err);
            outcome.issues.push(IssueCode::RerankDown);
        }
    }

    outcome.elapsed_ms = started.elapsed().as_millis() as u64;
    outcome
}

/// Order-sensitive candidate fingerprint: the same ids in a different order
/// are a different key.
fn fingerprint(query: &str, window: &[RerankCandidate], provider: &str, model: &str) -> String {
    let ids: Vec<&str> = window.iter().map(|c| c.id.as_str()).collect();
    let material = format!(
        "{}|{}|{}|{}",
        sha256_hex(query.as_bytes()),
        ids.join(","),
        provider,
        model
    );
    sha256_hex(material.as_bytes())
}

/// Reorder the window by provider score, descending. Stable: equal scores
/// keep the fused order.
fn order_by_scores(window: &[RerankCandidate], scores: &[f32]) -> Vec<String> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    indexed
        .into_iter()
        .map(|(index, _)| window[index].id.clone())
        .collect()
}
