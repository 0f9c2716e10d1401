use crate::diagnostics::{Diagnostics, GraphDiagnostics, IssueSet, StageTimings};
use crate::fusion::{self, DedupCandidate, FusedHit, StageHit};
use crate::graphrag::{self, GraphStageOutput};
use crate::request::{RetrievalMode, RetrievalRequest};
use crate::rerank::rerank_candidates;
use adapters::rerank::{RerankCandidate, Reranker};
use adapters::service::EmbeddingService;
use adapters::translate::NlTranslator;
use async_trait::async_trait;
use curio_core::error::{CurioError, ErrorCode, IssueCode};
use curio_core::manifest::Policy;
use curio_core::metrics::MetricsCollector;
use curio_core::model::{
    collection_name, now_ms, rfc3339, ContainerState, Document, GraphEdge, GraphNode, Modality,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::graph_store::GraphStore;
use storage::index::text::tokenize;
use storage::policy::{PolicyError, PolicyResolver};
use storage::registry::Registry;
use storage::vector::VectorStore;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Candidates hydrated for dedup/rerank; keeps pathological fan-outs bounded.
const MAX_CANDIDATES: usize = 100;
const SNIPPET_LEAD_CHARS: usize = 40;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub budget_safety_ms: u64,
    pub rrf_k0: f32,
    pub admission_limit: usize,
    pub admission_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget_safety_ms: 50,
            rrf_k0: 60.0,
            admission_limit: 64,
            admission_wait_ms: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("container unavailable: {0}")]
    ContainerUnavailable(String),
    #[error("container policy invalid: {0}")]
    PolicyInvalid(String),
    #[error("retrieval admission queue is full")]
    Overloaded,
}

impl CurioError for RetrievalError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RetrievalError::Invalid(_) | RetrievalError::PolicyInvalid(_) => {
                ErrorCode::InvalidArgument
            }
            RetrievalError::ContainerNotFound(_) => ErrorCode::NotFound,
            RetrievalError::ContainerUnavailable(_) => ErrorCode::Conflict,
            RetrievalError::Overloaded => ErrorCode::ResourceExhausted,
        }
    }
}

impl RetrievalError {
    pub fn issue(&self) -> IssueCode {
        match self {
            RetrievalError::Invalid(_) => IssueCode::PolicyInvalid,
            RetrievalError::ContainerNotFound(_) => IssueCode::ContainerNotFound,
            RetrievalError::ContainerUnavailable(_) => IssueCode::ContainerUnavailable,
            RetrievalError::PolicyInvalid(_) => IssueCode::PolicyInvalid,
            RetrievalError::Overloaded => IssueCode::Overloaded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<String>,
    pub fetcher: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub char_start: u64,
    pub char_end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub doc_id: String,
    pub container_id: String,
    pub container_name: String,
    pub title: String,
    pub snippet: String,
    pub uri: String,
    pub score: f32,
    pub stage_scores: BTreeMap<String, f32>,
    pub modality: Modality,
    pub provenance: Provenance,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphContext {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub snippets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutput {
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub results: Vec<RetrievalResult>,
    pub total_hits: usize,
    pub returned: usize,
    pub timings_ms: StageTimings,
    pub diagnostics: Diagnostics,
    pub issues: Vec<IssueCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_context: Option<GraphContext>,
}

/// Vector capability seam; the engine never assumes a concrete store so
/// tests and alternative backends can wrap it.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, String>;
    async fn fetch(&self, collection: &str, chunk_id: &str) -> Option<Vec<f32>>;
}

#[async_trait]
impl VectorSearch for VectorStore {
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(String, f32)>, String> {
        VectorStore::search(self, collection, query, k)
            .await
            .map_err(|err| err.to_string())
    }

    async fn fetch(&self, collection: &str, chunk_id: &str) -> Option<Vec<f32>> {
        self.get(collection, chunk_id).await.map(|(vector, _)| vector)
    }
}

#[async_trait]
pub trait LexicalSearch: Send + Sync {
    async fn search(
        &self,
        container_id: &str,
        query: &str,
        k: usize,
        modalities: &[Modality],
    ) -> Vec<(String, f32)>;
}

#[async_trait]
impl LexicalSearch for Registry {
    async fn search(
        &self,
        container_id: &str,
        query: &str,
        k: usize,
        modalities: &[Modality],
    ) -> Vec<(String, f32)> {
        self.bm25_search(container_id, query, k, modalities).await
    }
}

pub struct RetrievalEngine {
    policies: Arc<PolicyResolver>,
    registry: Arc<Registry>,
    lexical: Arc<dyn LexicalSearch>,
    vectors: Arc<dyn VectorSearch>,
    graph: Arc<GraphStore>,
    embeddings: Arc<EmbeddingService>,
    reranker: Option<Arc<dyn Reranker>>,
    translator: Option<Arc<dyn NlTranslator>>,
    admission: Arc<Semaphore>,
    metrics: Option<Arc<MetricsCollector>>,
    config: EngineConfig,
}

impl RetrievalEngine {
    pub fn new(
        policies: Arc<PolicyResolver>,
        registry: Arc<Registry>,
        vectors: Arc<VectorStore>,
        graph: Arc<GraphStore>,
        embeddings: Arc<EmbeddingService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            policies,
            lexical: registry.clone(),
            registry,
            vectors,
            graph,
            embeddings,
            reranker: None,
            translator: None,
            admission: Arc::new(Semaphore::new(config.admission_limit.max(1))),
            metrics: None,
            config,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn NlTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Swap the vector backend; used by tests to inject latency and faults.
    pub fn with_vector_backend(mut self, vectors: Arc<dyn VectorSearch>) -> Self {
        self.vectors = vectors;
        self
    }

    pub async fn retrieve(
        &self,
        request: RetrievalRequest,
    ) -> Result<RetrievalOutput, RetrievalError> {
        request
            .validate()
            .map_err(|err| RetrievalError::Invalid(err.to_string()))?;

        // Bounded admission; callers get a typed overload instead of queuing
        // behind a saturated process.
        let _permit = match tokio::time::timeout(
            Duration::from_millis(self.config.admission_wait_ms.max(1)),
            self.admission.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => return Err(RetrievalError::Overloaded),
        };

        let started = Instant::now();
        let mut issues = IssueSet::new();
        let mut diagnostics = Diagnostics::default();
        let mut timings = StageTimings::default();
        let mut partial = false;

        // Resolve every container; any unknown or non-active container
        // rejects the request.
        let mut policies: Vec<Policy> = Vec::new();
        let mut seen = HashSet::new();
        for container_ref in &request.container_ids {
            if !seen.insert(container_ref.clone()) {
                continue;
            }
            let policy = self
                .policies
                .resolve(container_ref, request.budget_ms)
                .await
                .map_err(|err| match err {
                    PolicyError::NotFound(id) => RetrievalError::ContainerNotFound(id),
                    PolicyError::Invalid(err) => RetrievalError::PolicyInvalid(err.to_string()),
                })?;
            if policy.state != ContainerState::Active {
                return Err(RetrievalError::ContainerUnavailable(container_ref.clone()));
            }
            policies.push(policy);
        }

        let budget_ms = policies
            .iter()
            .map(|p| p.budget_ms)
            .min()
            .unwrap_or_default();
        diagnostics.budget_ms = budget_ms;
        let stage_slice_ms = budget_ms
            .saturating_sub(self.config.budget_safety_ms)
            .max(1);

        let query_text = request.query.clone().unwrap_or_default();

        // Query embedding, one per distinct embedder among the containers.
        let mut dense_ok = request.mode.wants_dense();
        let mut query_vectors: HashMap<String, Vec<f32>> = HashMap::new();
        if request.mode.wants_dense() {
            for policy in &policies {
                let key = embedder_key(policy);
                if query_vectors.contains_key(&key) {
                    continue;
                }
                let embedded = match &request.query_image {
                    Some(bytes) if request.mode == RetrievalMode::Crossmodal => {
                        self.embeddings
                            .embed_image(&policy.embedder, bytes, false)
                            .await
                            .map(|v| vec![v])
                    }
                    _ => {
                        self.embeddings
                            .embed_texts(&policy.embedder, &[query_text.clone()], false)
                            .await
                    }
                };
                match embedded {
                    Ok(mut vectors) if !vectors.is_empty() => {
                        query_vectors.insert(key, vectors.remove(0));
                    }
                    Ok(_) => {
                        dense_ok = false;
                    }
                    Err(err) => {
                        warn!("query embedding failed: {}", err);
                        dense_ok = false;
                    }
                }
            }
            if !dense_ok {
                issues.push(IssueCode::EmbeddingDown);
                partial = true;
            }
        }

        // Stage plan. A pure-semantic request still attempts BM25 when the
        // embedder is down; the response is flagged partial either way.
        let lexical_enabled = match request.mode {
            RetrievalMode::Bm25 | RetrievalMode::Hybrid | RetrievalMode::HybridGraph => true,
            RetrievalMode::Semantic => !dense_ok,
            RetrievalMode::Crossmodal | RetrievalMode::Graph => false,
        };
        let vector_enabled = dense_ok
            && matches!(
                request.mode,
                RetrievalMode::Semantic
                    | RetrievalMode::Hybrid
                    | RetrievalMode::Crossmodal
                    | RetrievalMode::HybridGraph
            );
        let graph_enabled =
            request.mode.wants_graph() && policies.iter().any(|p| p.graph.is_some());

        let fetch_k = (request.k * 2).clamp(request.k, MAX_CANDIDATES);

        // Fan out: one task per enabled stage, all bounded by the same
        // slice. A stage that overruns is cancelled and reported by code.
        let mut stage_handles: Vec<AbortOnDrop<StageOutcome>> = Vec::new();

        if lexical_enabled {
            let lexical = self.lexical.clone();
            let policies = policies.clone();
            let query = query_text.clone();
            stage_handles.push(spawn_stage("bm25", stage_slice_ms, async move {
                let mut hits = Vec::new();
                for policy in &policies {
                    for (chunk_id, score) in lexical
                        .search(&policy.container_id, &query, fetch_k, &policy.modalities)
                        .await
                    {
                        hits.push(StageHit { chunk_id, score });
                    }
                }
                sort_stage_hits(&mut hits);
                StageBody {
                    hits,
                    graph: None,
                }
            }));
        }

        if vector_enabled {
            let vectors = self.vectors.clone();
            let policies = policies.clone();
            let query_vectors = query_vectors.clone();
            let crossmodal = request.mode == RetrievalMode::Crossmodal;
            stage_handles.push(spawn_stage("vector", stage_slice_ms, async move {
                let mut hits = Vec::new();
                for policy in &policies {
                    let Some(vector) = query_vectors.get(&embedder_key(policy)) else {
                        continue;
                    };
                    let modality = if crossmodal {
                        Modality::Image
                    } else {
                        Modality::Text
                    };
                    let collection = collection_name(&policy.container_id, modality);
                    match vectors.search(&collection, vector, fetch_k).await {
                        Ok(found) => {
                            for (chunk_id, score) in found {
                                hits.push(StageHit { chunk_id, score });
                            }
                        }
                        Err(err) => debug!(collection, "vector search skipped: {}", err),
                    }
                }
                sort_stage_hits(&mut hits);
                StageBody {
                    hits,
                    graph: None,
                }
            }));
        }

        if graph_enabled {
            let graph = self.graph.clone();
            let translator = self.translator.clone();
            let policies = policies.clone();
            let query = query_text.clone();
            let options = request.graph.clone().unwrap_or_default();
            stage_handles.push(spawn_stage("graph", stage_slice_ms, async move {
                let mut merged = GraphStageOutput::default();
                for policy in &policies {
                    let Some(graph_policy) = &policy.graph else {
                        continue;
                    };
                    let output = graphrag::run_graph_stage(
                        &graph,
                        translator.as_ref(),
                        graph_policy,
                        &policy.container_id,
                        &query,
                        options.max_hops,
                        options.neighbor_k,
                    )
                    .await;
                    merged.hits.extend(output.hits);
                    merged.nodes.extend(output.nodes);
                    merged.edges.extend(output.edges);
                    merged.issues.extend(output.issues);
                    merged.execution_ms = merged.execution_ms.max(output.execution_ms);
                    if merged.fallback.is_none() {
                        merged.fallback = output.fallback;
                    }
                }
                sort_stage_hits(&mut merged.hits);
                let hits = merged.hits.clone();
                StageBody {
                    hits,
                    graph: Some(merged),
                }
            }));
        }

        // Fan in.
        let mut stage_results: Vec<(&'static str, Vec<StageHit>)> = Vec::new();
        let mut graph_parts: Option<GraphStageOutput> = None;
        for handle in stage_handles {
            let outcome = match handle.join().await {
                Some(outcome) => outcome,
                None => continue, // stage task panicked; treat as absent
            };

            let elapsed = if outcome.timed_out {
                // The stage was still running when its slice expired; report
                // the whole budget as consumed.
                outcome.elapsed_ms.max(budget_ms)
            } else {
                outcome.elapsed_ms
            };
            match outcome.name {
                "bm25" => timings.bm25_ms = elapsed,
                "vector" => timings.vector_ms = elapsed,
                _ => timings.graph_ms = elapsed,
            }

            if outcome.timed_out {
                partial = true;
                issues.push(IssueCode::LatencyBudgetExceeded);
                issues.push(match outcome.name {
                    "bm25" => IssueCode::Bm25Timeout,
                    "vector" => IssueCode::VectorTimeout,
                    _ => IssueCode::GraphTimeout,
                });
                continue;
            }

            let Some(body) = outcome.body else {
                continue;
            };
            diagnostics
                .hit_counts
                .insert(outcome.name.to_string(), body.hits.len());
            if let Some(graph_output) = body.graph {
                for issue in &graph_output.issues {
                    issues.push(*issue);
                }
                diagnostics.graph = Some(GraphDiagnostics {
                    fallback: graph_output.fallback.clone(),
                    node_count: graph_output.nodes.len(),
                    edge_count: graph_output.edges.len(),
                    execution_ms: graph_output.execution_ms,
                });
                stage_results.push((outcome.name, body.hits));
                graph_parts = Some(graph_output);
            } else {
                stage_results.push((outcome.name, body.hits));
            }
        }

        // Fuse, freshen, dedup.
        let fuse_started = Instant::now();
        let fused = fusion::rrf_fuse(&stage_results, self.config.rrf_k0);
        let total_hits = fused.len();

        let candidates = self
            .hydrate(&policies, fused, request.mode)
            .await;
        let semantic_threshold = policies
            .iter()
            .map(|p| p.semantic_threshold)
            .fold(f32::MAX, f32::min);
        let (mut kept, elided) = fusion::dedup_results(
            candidates,
            if semantic_threshold == f32::MAX {
                1.0
            } else {
                semantic_threshold
            },
        );
        diagnostics.elided_chunk_ids = elided;
        timings.fuse_ms = fuse_started.elapsed().as_millis() as u64;

        // Budget-guarded rerank over the fused head.
        let rerank_policy = policies.iter().find_map(|p| p.rerank.clone());
        let rerank_requested = request.rerank.unwrap_or(true);
        if let Some(rerank_policy) = rerank_policy.filter(|_| rerank_requested && !kept.is_empty())
        {
            let rerank_window: Vec<RerankCandidate> = kept
                .iter()
                .map(|candidate| RerankCandidate {
                    id: candidate.chunk.id.clone(),
                    text: candidate.chunk.text.clone(),
                })
                .collect();
            let elapsed = started.elapsed().as_millis() as u64;
            let remaining = budget_ms.saturating_sub(elapsed);
            let outcome = rerank_candidates(
                &self.registry,
                self.reranker.as_ref(),
                &rerank_policy,
                &query_text,
                &rerank_window,
                request.k,
                remaining,
            )
            .await;

            timings.rerank_ms = outcome.elapsed_ms;
            diagnostics.rerank.applied = outcome.applied;
            diagnostics.rerank.cache = outcome.cache;
            diagnostics.rerank.provider = Some(rerank_policy.provider.clone());
            diagnostics.rerank.model = Some(rerank_policy.model.clone());
            for issue in outcome.issues {
                issues.push(issue);
            }
            if let Some(order) = outcome.new_order {
                kept = apply_order(kept, &order);
            }
        }

        // Render.
        let results: Vec<RetrievalResult> = {
            let mut out = Vec::new();
            for candidate in kept.iter().take(request.k) {
                match self.render(&policies, candidate, &query_text).await {
                    Some(result) => out.push(result),
                    None => error!(
                        chunk_id = %candidate.chunk.id,
                        "chunk lost its document during rendering, skipping"
                    ),
                }
            }
            out
        };

        if results.is_empty() {
            issues.push(IssueCode::NoHits);
        }

        let graph_context = graph_parts
            .filter(|parts| !parts.nodes.is_empty())
            .map(|parts| GraphContext {
                snippets: parts
                    .nodes
                    .iter()
                    .map(|node| node.summary.clone())
                    .collect(),
                nodes: parts.nodes,
                edges: parts.edges,
            });

        timings.total_ms = started.elapsed().as_millis() as u64;
        if timings.total_ms > budget_ms {
            issues.push(IssueCode::LatencyBudgetExceeded);
            partial = true;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_retrieval(
                timings.total_ms,
                partial,
                diagnostics.rerank.applied,
                matches!(
                    diagnostics.rerank.cache,
                    Some(crate::diagnostics::CacheStatus::Hit)
                ),
            );
        }

        let returned = results.len();
        Ok(RetrievalOutput {
            partial,
            query: request.query.clone(),
            results,
            total_hits,
            returned,
            timings_ms: timings,
            diagnostics,
            issues: issues.into_vec(),
            graph_context,
        })
    }

    /// Hydrate fused hits into dedup candidates: chunk record, freshness
    /// adjustment from the owning document, and the canonical vector when
    /// available. Chunks missing from the registry are skipped, not fatal.
    async fn hydrate(
        &self,
        policies: &[Policy],
        fused: Vec<FusedHit>,
        mode: RetrievalMode,
    ) -> Vec<DedupCandidate> {
        let lambda_by_container: HashMap<&str, f32> = policies
            .iter()
            .map(|p| (p.container_id.as_str(), p.freshness_lambda))
            .collect();

        let now = now_ms();
        let mut documents: HashMap<String, Document> = HashMap::new();
        let mut candidates = Vec::new();

        for mut hit in fused.into_iter().take(MAX_CANDIDATES) {
            let Some(chunk) = self.registry.get_chunk(&hit.chunk_id).await else {
                error!(chunk_id = %hit.chunk_id, "stage hit references unknown chunk, skipping");
                continue;
            };

            let document = match documents.get(&chunk.document_id) {
                Some(document) => document.clone(),
                None => match self.registry.get_document(&chunk.document_id).await {
                    Some(document) => {
                        documents.insert(chunk.document_id.clone(), document.clone());
                        document
                    }
                    None => {
                        error!(
                            chunk_id = %chunk.id,
                            document_id = %chunk.document_id,
                            "chunk without document, skipping"
                        );
                        continue;
                    }
                },
            };

            let lambda = lambda_by_container
                .get(chunk.container_id.as_str())
                .copied()
                .unwrap_or(0.0);
            let age_days = (now - document.ingested_at_ms).max(0) as f32 / 86_400_000.0;
            hit.score *= fusion::freshness_factor(lambda, Some(age_days));

            let modality = if mode == RetrievalMode::Crossmodal {
                Modality::Image
            } else {
                chunk.modality
            };
            let collection = collection_name(&chunk.container_id, modality);
            let canonical_id = chunk.dedup_of.clone().unwrap_or_else(|| chunk.id.clone());
            let vector = self.vectors.fetch(&collection, &canonical_id).await;

            candidates.push(DedupCandidate { hit, chunk, vector });
        }

        candidates.sort_by(|a, b| {
            b.hit
                .score
                .partial_cmp(&a.hit.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        candidates
    }

    async fn render(
        &self,
        policies: &[Policy],
        candidate: &DedupCandidate,
        query: &str,
    ) -> Option<RetrievalResult> {
        let chunk = &candidate.chunk;
        let document = self.registry.get_document(&chunk.document_id).await?;
        let policy = policies
            .iter()
            .find(|p| p.container_id == chunk.container_id)?;

        let snippet = render_snippet(&chunk.text, query, policy.snippet_max_chars);
        let mut meta = BTreeMap::new();
        meta.insert("mime".to_string(), document.mime.clone());

        Some(RetrievalResult {
            chunk_id: chunk.id.clone(),
            doc_id: document.id.clone(),
            container_id: chunk.container_id.clone(),
            container_name: policy.slug.clone(),
            title: document.title.clone(),
            snippet,
            uri: document.uri.clone(),
            score: candidate.hit.score,
            stage_scores: candidate
                .hit
                .stage_scores
                .iter()
                .map(|(name, score)| (name.clone(), *score))
                .collect(),
            modality: chunk.modality,
            provenance: Provenance {
                ingested_at: Some(rfc3339(document.ingested_at_ms)),
                fetcher: document.fetcher.clone(),
                page: chunk.page,
                char_start: chunk.char_start,
                char_end: chunk.char_end,
                dedup_of: chunk.dedup_of.clone(),
            },
            meta,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphSearchMode {
    Nl,
    Expand,
    CypherLike,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchRequest {
    pub container: String,
    #[serde(default)]
    pub query: Option<String>,
    pub mode: GraphSearchMode,
    #[serde(default)]
    pub max_hops: Option<u8>,
    #[serde(default = "default_graph_k")]
    pub k: usize,
    #[serde(default)]
    pub expand_from_vector: bool,
}

fn default_graph_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchOutput {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Source chunk ids backing the subgraph, ranked.
    pub chunk_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    pub issues: Vec<IssueCode>,
    pub execution_ms: u64,
}

impl RetrievalEngine {
    /// Direct graph retrieval for the graph API: NL translation (or
    /// cypher-like input through the same validator), token-match expansion,
    /// or expansion seeded from the vector head.
    pub async fn graph_search(
        &self,
        request: GraphSearchRequest,
    ) -> Result<GraphSearchOutput, RetrievalError> {
        let policy = self
            .policies
            .resolve(&request.container, None)
            .await
            .map_err(|err| match err {
                PolicyError::NotFound(id) => RetrievalError::ContainerNotFound(id),
                PolicyError::Invalid(err) => RetrievalError::PolicyInvalid(err.to_string()),
            })?;
        if policy.state != ContainerState::Active {
            return Err(RetrievalError::ContainerUnavailable(request.container));
        }
        let Some(graph_policy) = policy.graph.clone() else {
            return Err(RetrievalError::Invalid(format!(
                "container {} does not enable graph retrieval",
                policy.slug
            )));
        };

        let started = Instant::now();
        let query_text = request.query.clone().unwrap_or_default();
        let max_hops = request
            .max_hops
            .unwrap_or(graph_policy.max_hops)
            .min(graph_policy.max_hops);

        let output = match request.mode {
            GraphSearchMode::Nl | GraphSearchMode::CypherLike => {
                if query_text.trim().is_empty() {
                    return Err(RetrievalError::Invalid(
                        "graph search requires a query".to_string(),
                    ));
                }
                graphrag::run_graph_stage(
                    &self.graph,
                    self.translator.as_ref(),
                    &graph_policy,
                    &policy.container_id,
                    &query_text,
                    request.max_hops,
                    request.k,
                )
                .await
            }
            GraphSearchMode::Expand => {
                let mut seed_nodes = Vec::new();
                if request.expand_from_vector && !query_text.trim().is_empty() {
                    if let Ok(mut vectors) = self
                        .embeddings
                        .embed_texts(&policy.embedder, &[query_text.clone()], false)
                        .await
                    {
                        if let Some(vector) = vectors.pop() {
                            let collection =
                                collection_name(&policy.container_id, Modality::Text);
                            if let Ok(hits) =
                                self.vectors.search(&collection, &vector, request.k).await
                            {
                                let chunk_ids: Vec<String> =
                                    hits.into_iter().map(|(id, _)| id).collect();
                                seed_nodes = self
                                    .graph
                                    .find_nodes_by_source_chunks(
                                        &policy.container_id,
                                        &chunk_ids,
                                    )
                                    .await;
                            }
                        }
                    }
                }

                let mut output = GraphStageOutput::default();
                if seed_nodes.is_empty() {
                    output = graphrag::run_graph_stage(
                        &self.graph,
                        None,
                        &graph_policy,
                        &policy.container_id,
                        &query_text,
                        request.max_hops,
                        request.k,
                    )
                    .await;
                } else {
                    let seed_ids: Vec<String> =
                        seed_nodes.iter().map(|node| node.id.clone()).collect();
                    let (nodes, edges) = self
                        .graph
                        .expand(&policy.container_id, &seed_ids, max_hops)
                        .await;
                    output.hits = nodes
                        .iter()
                        .map(|node| StageHit {
                            chunk_id: node.source_chunk_id.clone(),
                            score: 1.0,
                        })
                        .collect();
                    output.nodes = nodes;
                    output.edges = edges;
                }
                output
            }
        };

        let mut chunk_ids: Vec<String> =
            output.hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        chunk_ids.dedup();

        Ok(GraphSearchOutput {
            nodes: output.nodes,
            edges: output.edges,
            chunk_ids,
            fallback: output.fallback,
            issues: output.issues,
            execution_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn embedder_key(policy: &Policy) -> String {
    format!("{}@{}", policy.embedder.id, policy.embedder.version)
}

fn sort_stage_hits(hits: &mut [StageHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Reorder kept candidates to match the reranked prefix; anything not named
/// keeps its fused position after the prefix.
fn apply_order(kept: Vec<DedupCandidate>, order: &[String]) -> Vec<DedupCandidate> {
    let mut by_id: HashMap<String, DedupCandidate> = kept
        .into_iter()
        .map(|candidate| (candidate.chunk.id.clone(), candidate))
        .collect();

    let mut out = Vec::with_capacity(by_id.len());
    for chunk_id in order {
        if let Some(candidate) = by_id.remove(chunk_id) {
            out.push(candidate);
        }
    }
    let mut rest: Vec<DedupCandidate> = by_id.into_values().collect();
    rest.sort_by(|a, b| {
        b.hit
            .score
            .partial_cmp(&a.hit.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    out.extend(rest);
    out
}

/// Snippet: a window starting shortly before the first query-token match,
/// clamped to the policy budget. Char-accurate for non-ascii text.
fn render_snippet(text: &str, query: &str, max_chars: usize) -> String {
    if text.is_empty() || max_chars == 0 {
        return String::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let lowered = text.to_lowercase();
    let match_char = tokenize(query)
        .into_iter()
        .filter_map(|token| lowered.find(&token))
        .min()
        .map(|byte_offset| lowered[..byte_offset].chars().count())
        .unwrap_or(0);

    let start = match_char.saturating_sub(SNIPPET_LEAD_CHARS);
    let end = (start + max_chars).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet = format!("…{}", snippet);
    }
    if end < chars.len() {
        snippet.push('…');
    }
    snippet
}

struct StageBody {
    hits: Vec<StageHit>,
    graph: Option<GraphStageOutput>,
}

struct StageOutcome {
    name: &'static str,
    elapsed_ms: u64,
    timed_out: bool,
    body: Option<StageBody>,
}

/// Spawn a stage task bounded by the shared slice. The wrapper cancels the
/// body at the deadline and reports the overrun instead of failing the
/// request.
fn spawn_stage<F>(
    name: &'static str,
    slice_ms: u64,
    body: F,
) -> AbortOnDrop<StageOutcome>
where
    F: std::future::Future<Output = StageBody> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let started = Instant::now();
        match tokio::time::timeout(Duration::from_millis(slice_ms), body).await {
            Ok(stage_body) => StageOutcome {
                name,
                elapsed_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
                body: Some(stage_body),
            },
            Err(_) => StageOutcome {
                name,
                elapsed_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
                body: None,
            },
        }
    });
    AbortOnDrop {
        handle: Some(handle),
    }
}

/// Request cancellation propagates: dropping the retrieval future aborts
/// every in-flight stage task.
struct AbortOnDrop<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> AbortOnDrop<T> {
    async fn join(mut self) -> Option<T> {
        let handle = self.handle.take()?;
        handle.await.ok()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
