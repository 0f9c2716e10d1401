use crate::envelope::{new_request_id, ApiError, OpResponse, RetrieveResponse, API_VERSION};
use crate::lifecycle::{ExportPayload, Lifecycle, ManifestPatch};
use crate::system::SystemReporter;
use adapters::embedder::{DeterministicEmbedder, TokenHashEmbedder};
use adapters::extract::KeywordEntityExtractor;
use adapters::registry::AdapterRegistry;
use adapters::rerank::LexicalReranker;
use adapters::service::EmbeddingService;
use adapters::translate::KeywordTranslator;
use curio_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use curio_core::auth::{Principal, TokenVerifier};
use curio_core::config::AppConfig;
use curio_core::error::{CurioError, ErrorCode, IssueCode};
use curio_core::manifest::ContainerManifest;
use curio_core::metrics::MetricsCollector;
use curio_core::model::{
    collection_name, now_ms, rfc3339, sha256_hex, Container, ContainerState, GraphEdge,
    GraphNode, Job, JobKind, JobState,
};
use ingestion::graph_build::GraphBuilder;
use ingestion::processor::{IngestJobPayload, IngestProcessor, IngestSource};
use jobs::queue::{JobQueue, QueueConfig};
use jobs::worker::{WorkerPool, WorkerPoolHandle};
use query::engine::{
    EngineConfig, GraphSearchOutput, GraphSearchRequest, RetrievalEngine, RetrievalError,
};
use query::request::RetrievalRequest;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::blob::BlobStore;
use storage::graph_store::{GraphSchema, GraphStore, UpsertMode};
use storage::policy::PolicyResolver;
use storage::registry::{ContainerFilter, Registry};
use storage::vector::VectorStore;
use tracing::{info, warn};

/// Authenticated request context. The request id is echoed on every
/// response and correlates the audit trail.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    pub request_id: String,
}

/// The assembled core plus its background worker pool and maintenance
/// sweep.
pub struct ServiceHandle {
    pub service: Arc<CurioService>,
    pub workers: WorkerPoolHandle,
    maintenance: tokio::task::JoinHandle<()>,
}

impl ServiceHandle {
    pub async fn shutdown(self) {
        self.maintenance.abort();
        self.workers.shutdown().await;
    }
}

pub struct CurioService {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
    blobs: Arc<BlobStore>,
    graph: Arc<GraphStore>,
    policies: Arc<PolicyResolver>,
    embeddings: Arc<EmbeddingService>,
    queue: Arc<JobQueue>,
    engine: RetrievalEngine,
    lifecycle: Lifecycle,
    verifier: Arc<dyn TokenVerifier>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsCollector>,
}

impl CurioService {
    /// Assemble every singleton from configuration: stores, caches, adapter
    /// registries, engine, worker pool. No module-load side effects; this is
    /// the process lifecycle entry point.
    pub async fn open(
        config: &AppConfig,
        verifier: Arc<dyn TokenVerifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<ServiceHandle, anyhow::Error> {
        let data_dir = Path::new(&config.storage.data_dir);
        let registry = Arc::new(
            Registry::open_with_backups(
                data_dir.join("registry.journal"),
                data_dir.join("backups"),
            )
            .await?,
        );
        let vectors = Arc::new(VectorStore::open(data_dir.join("vector.journal")).await?);
        let graph = Arc::new(GraphStore::open(data_dir.join("graph.journal")).await?);
        let blobs = Arc::new(BlobStore::open(data_dir.join("blobs")).await?);

        let policies = Arc::new(PolicyResolver::new(
            registry.clone(),
            config.retrieval.global_budget_ms,
            Duration::from_secs(config.cache.policy_ttl_s),
        ));

        let embeddings = Arc::new(EmbeddingService::new(
            AdapterRegistry::new(),
            AdapterRegistry::new(),
            Duration::from_millis(config.adapters.embed_timeout_ms),
            config.adapters.breaker_threshold,
            Duration::from_millis(config.adapters.breaker_cooldown_ms),
            config.adapters.ingest_rate_per_s,
        ));
        embeddings.register_text(Arc::new(TokenHashEmbedder::default()))?;
        embeddings.register_text(Arc::new(DeterministicEmbedder::default()))?;
        embeddings.register_image(Arc::new(DeterministicEmbedder::default()))?;

        let queue = Arc::new(JobQueue::new(
            registry.clone(),
            QueueConfig {
                lease_ms: config.jobs.lease_ms,
                max_attempts: config.jobs.max_attempts,
                backoff_base_ms: config.jobs.backoff_base_ms,
                backoff_cap_ms: config.jobs.backoff_cap_ms,
            },
        ));

        let metrics = Arc::new(MetricsCollector::new(1024));

        let engine = RetrievalEngine::new(
            policies.clone(),
            registry.clone(),
            vectors.clone(),
            graph.clone(),
            embeddings.clone(),
            EngineConfig {
                budget_safety_ms: config.retrieval.budget_safety_ms,
                rrf_k0: config.retrieval.rrf_k0,
                admission_limit: config.retrieval.admission_limit,
                admission_wait_ms: config.retrieval.admission_wait_ms,
            },
        )
        .with_reranker(Arc::new(LexicalReranker::default()))
        .with_translator(Arc::new(KeywordTranslator))
        .with_metrics(metrics.clone());

        let lifecycle = Lifecycle::new(
            registry.clone(),
            vectors.clone(),
            blobs.clone(),
            graph.clone(),
            policies.clone(),
            queue.clone(),
        );

        let ingest = Arc::new(IngestProcessor::new(
            registry.clone(),
            vectors.clone(),
            blobs.clone(),
            policies.clone(),
            embeddings.clone(),
            queue.clone(),
            Duration::from_millis(config.adapters.embed_timeout_ms.max(1_000)),
            config.cache.embedding_ttl_s,
        ));
        let graph_builder = Arc::new(GraphBuilder::new(
            registry.clone(),
            graph.clone(),
            Arc::new(KeywordEntityExtractor::default()),
            Duration::from_millis(config.adapters.translate_timeout_ms),
            config.adapters.breaker_threshold,
            Duration::from_millis(config.adapters.breaker_cooldown_ms),
        ));
        let refresh = Arc::new(crate::lifecycle::RefreshProcessor::new(
            registry.clone(),
            vectors.clone(),
            embeddings.clone(),
            policies.clone(),
        ));
        let export = Arc::new(crate::lifecycle::ExportProcessor::new(
            registry.clone(),
            vectors.clone(),
            blobs.clone(),
        ));

        let workers = WorkerPool::new(
            queue.clone(),
            config.jobs.pool_size,
            Duration::from_millis(config.jobs.claim_interval_ms),
        )
        .register(ingest)
        .register(graph_builder)
        .register(refresh)
        .register(export)
        .start();

        // Background sweep: expired cache entries and orphaned blob
        // directories.
        let maintenance = {
            let registry = registry.clone();
            let blobs = blobs.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(err) = registry.sweep_caches(now_ms()).await {
                        warn!("cache sweep failed: {}", err);
                    }
                    for container in registry.list_containers(&Default::default()).await {
                        let known: std::collections::HashSet<String> = registry
                            .list_documents(&container.id)
                            .await
                            .iter()
                            .map(|d| d.id.clone())
                            .collect();
                        if let Err(err) = blobs.sweep_orphans(&container.id, &known).await {
                            warn!(container_id = %container.id, "blob sweep failed: {}", err);
                        }
                    }
                }
            })
        };

        let service = Arc::new(CurioService {
            registry,
            vectors,
            blobs,
            graph,
            policies,
            embeddings,
            queue,
            engine,
            lifecycle,
            verifier,
            audit,
            metrics,
        });

        info!("curio core assembled");
        Ok(ServiceHandle {
            service,
            workers,
            maintenance,
        })
    }

    // ------------------------------------------------------------------
    // Auth
    // ------------------------------------------------------------------

    pub async fn authenticate(
        &self,
        bearer_token: &str,
        agent_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<RequestContext, ApiError> {
        let request_id = new_request_id();
        let mut principal = self.verifier.verify(bearer_token).map_err(|err| {
            ApiError::new(ErrorCode::Unauthenticated, err.to_string(), &request_id)
        })?;

        if let Some(agent_id) = agent_id {
            principal = principal.with_agent(agent_id, agent_name.map(|s| s.to_string()));
            // Observability only; failures must not block the request.
            if let Err(err) = self
                .registry
                .touch_agent_session(
                    agent_id.to_string(),
                    agent_name.map(|s| s.to_string()),
                    now_ms(),
                )
                .await
            {
                warn!("agent session upsert failed: {}", err);
            }
        }

        Ok(RequestContext {
            principal,
            request_id,
        })
    }

    async fn authorize_container(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
    ) -> Result<Container, ApiError> {
        let container = self
            .registry
            .find_container(container_ref)
            .await
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::NotFound,
                    format!("container not found: {}", container_ref),
                    &ctx.request_id,
                )
                .with_issue(IssueCode::ContainerNotFound)
            })?;

        if !container.manifest.allows_subject(&ctx.principal.subject) {
            return Err(ApiError::new(
                ErrorCode::PermissionDenied,
                format!("subject is not on the acl of {}", container.manifest.slug),
                &ctx.request_id,
            ));
        }
        Ok(container)
    }

    fn record_audit(
        &self,
        ctx: &RequestContext,
        operation: AuditOperation,
        outcome: AuditOutcome,
        container_id: Option<String>,
    ) {
        let mut event = AuditEvent::new(operation, outcome);
        event.request_id = Some(ctx.request_id.clone());
        event.container_id = container_id;
        event.subject = Some(ctx.principal.subject.clone());
        event.agent_id = ctx.principal.agent_id.clone();
        event.agent_name = ctx.principal.agent_name.clone();
        let _ = self.audit.record(event);
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    pub async fn retrieve(
        &self,
        ctx: &RequestContext,
        request: RetrievalRequest,
    ) -> Result<RetrieveResponse, ApiError> {
        // ACL gate before any stage runs.
        for container_ref in &request.container_ids {
            self.authorize_container(ctx, container_ref).await?;
        }

        match self.engine.retrieve(request).await {
            Ok(output) => {
                self.record_audit(ctx, AuditOperation::Retrieve, AuditOutcome::Succeeded, None);
                Ok(RetrieveResponse {
                    version: API_VERSION.to_string(),
                    request_id: ctx.request_id.clone(),
                    output,
                })
            }
            Err(err) => {
                self.record_audit(ctx, AuditOperation::Retrieve, AuditOutcome::Failed, None);
                Err(self.map_retrieval_error(ctx, err))
            }
        }
    }

    fn map_retrieval_error(&self, ctx: &RequestContext, err: RetrievalError) -> ApiError {
        let issue = err.issue();
        ApiError::new(err.error_code(), err.to_string(), &ctx.request_id).with_issue(issue)
    }

    // ------------------------------------------------------------------
    // Container lifecycle
    // ------------------------------------------------------------------

    pub async fn create_container(
        &self,
        ctx: &RequestContext,
        manifest: ContainerManifest,
    ) -> Result<ContainerView, ApiError> {
        let started = Instant::now();
        let result = self.lifecycle.create(manifest).await;
        match result {
            Ok(container) => {
                self.record_audit(
                    ctx,
                    AuditOperation::Lifecycle,
                    AuditOutcome::Succeeded,
                    Some(container.id.clone()),
                );
                Ok(ContainerView::from_container(
                    &container,
                    true,
                    started.elapsed().as_millis() as u64,
                    &ctx.request_id,
                ))
            }
            Err(err) => {
                self.record_audit(ctx, AuditOperation::Lifecycle, AuditOutcome::Failed, None);
                Err(ApiError::new(err.error_code(), err.to_string(), &ctx.request_id))
            }
        }
    }

    pub async fn describe_container(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        include_stats: bool,
    ) -> Result<ContainerView, ApiError> {
        let container = self.authorize_container(ctx, container_ref).await?;
        Ok(ContainerView::from_container(
            &container,
            include_stats,
            0,
            &ctx.request_id,
        ))
    }

    pub async fn list_containers(
        &self,
        ctx: &RequestContext,
        filter: &ContainerFilter,
        include_stats: bool,
    ) -> Vec<ContainerView> {
        self.lifecycle
            .list(filter)
            .await
            .into_iter()
            .filter(|c| c.manifest.allows_subject(&ctx.principal.subject))
            .map(|c| ContainerView::from_container(&c, include_stats, 0, &ctx.request_id))
            .collect()
    }

    pub async fn update_container(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        patch: ManifestPatch,
    ) -> Result<OpResponse, ApiError> {
        let started = Instant::now();
        let container = self.authorize_container(ctx, container_ref).await?;
        self.lifecycle
            .update(&container.id, patch)
            .await
            .map_err(|err| ApiError::new(err.error_code(), err.to_string(), &ctx.request_id))?;
        self.record_audit(
            ctx,
            AuditOperation::Lifecycle,
            AuditOutcome::Succeeded,
            Some(container.id),
        );
        Ok(OpResponse::success(
            &ctx.request_id,
            started.elapsed().as_millis() as u64,
        ))
    }

    pub async fn delete_container(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        hard: bool,
    ) -> Result<OpResponse, ApiError> {
        let started = Instant::now();
        let container = self.authorize_container(ctx, container_ref).await?;
        self.lifecycle
            .delete(&container.id, hard)
            .await
            .map_err(|err| ApiError::new(err.error_code(), err.to_string(), &ctx.request_id))?;
        self.record_audit(
            ctx,
            AuditOperation::Lifecycle,
            AuditOutcome::Succeeded,
            Some(container.id),
        );
        Ok(OpResponse::success(
            &ctx.request_id,
            started.elapsed().as_millis() as u64,
        ))
    }

    pub async fn refresh_container(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        embedder_version: String,
    ) -> Result<OpResponse, ApiError> {
        let started = Instant::now();
        let container = self.authorize_container(ctx, container_ref).await?;
        let job = self
            .lifecycle
            .refresh(
                &container.id,
                embedder_version,
                ctx.principal.agent_id.clone(),
            )
            .await
            .map_err(|err| ApiError::new(err.error_code(), err.to_string(), &ctx.request_id))?;
        Ok(OpResponse::job(
            &ctx.request_id,
            job.id,
            started.elapsed().as_millis() as u64,
        ))
    }

    pub async fn export_container(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        payload: ExportPayload,
    ) -> Result<OpResponse, ApiError> {
        let started = Instant::now();
        let container = self.authorize_container(ctx, container_ref).await?;
        let job = self
            .lifecycle
            .export(&container.id, payload, ctx.principal.agent_id.clone())
            .await
            .map_err(|err| ApiError::new(err.error_code(), err.to_string(), &ctx.request_id))?;
        Ok(OpResponse::job(
            &ctx.request_id,
            job.id,
            started.elapsed().as_millis() as u64,
        ))
    }

    // ------------------------------------------------------------------
    // Source ingestion and job status
    // ------------------------------------------------------------------

    pub async fn add_sources(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        sources: Vec<IngestSource>,
        mode: AddMode,
        timeout_ms: Option<u64>,
    ) -> Result<AddSourcesResponse, ApiError> {
        if sources.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "sources must not be empty",
                &ctx.request_id,
            ));
        }
        let container = self.authorize_container(ctx, container_ref).await?;

        let mut job_ids = Vec::new();
        for source in &sources {
            let payload = IngestJobPayload {
                source: source.clone(),
            };
            let source_json = serde_json::to_string(source).map_err(|err| {
                ApiError::new(ErrorCode::InvalidArgument, err.to_string(), &ctx.request_id)
            })?;
            let idempotency_key = format!(
                "ingest:{}:{}",
                container.id,
                sha256_hex(source_json.as_bytes())
            );
            let job = self
                .queue
                .enqueue(
                    JobKind::Ingest,
                    &container.id,
                    &payload,
                    Some(idempotency_key),
                    ctx.principal.agent_id.clone(),
                )
                .await
                .map_err(|err| {
                    ApiError::new(ErrorCode::Internal, err.to_string(), &ctx.request_id)
                })?;
            job_ids.push(job.id);
        }
        self.record_audit(
            ctx,
            AuditOperation::Ingest,
            AuditOutcome::Succeeded,
            Some(container.id.clone()),
        );

        if mode == AddMode::Blocking {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms.unwrap_or(30_000));
            loop {
                let jobs = self.queue.status(&job_ids).await;
                if jobs.iter().all(|job| job.state.is_terminal()) || Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let jobs = self
            .queue
            .status(&job_ids)
            .await
            .iter()
            .map(JobView::from_job)
            .collect();

        Ok(AddSourcesResponse {
            version: API_VERSION.to_string(),
            request_id: ctx.request_id.clone(),
            jobs,
        })
    }

    pub async fn job_status(
        &self,
        ctx: &RequestContext,
        job_ids: &[String],
    ) -> JobStatusResponse {
        JobStatusResponse {
            version: API_VERSION.to_string(),
            request_id: ctx.request_id.clone(),
            jobs: self
                .queue
                .status(job_ids)
                .await
                .iter()
                .map(JobView::from_job)
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub async fn list_documents(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
    ) -> Result<Vec<DocumentView>, ApiError> {
        let container = self.authorize_container(ctx, container_ref).await?;
        Ok(self
            .registry
            .list_documents(&container.id)
            .await
            .iter()
            .map(DocumentView::from_document)
            .collect())
    }

    pub async fn fetch_document(
        &self,
        ctx: &RequestContext,
        document_id: &str,
    ) -> Result<DocumentView, ApiError> {
        let document = self.registry.get_document(document_id).await.ok_or_else(|| {
            ApiError::new(
                ErrorCode::NotFound,
                format!("document not found: {}", document_id),
                &ctx.request_id,
            )
        })?;
        self.authorize_container(ctx, &document.container_id).await?;
        Ok(DocumentView::from_document(&document))
    }

    /// Delete a document and cascade: vector rows move to promoted dedup
    /// peers or are removed, blobs and graph entities go with it.
    pub async fn delete_document(
        &self,
        ctx: &RequestContext,
        document_id: &str,
    ) -> Result<OpResponse, ApiError> {
        let started = Instant::now();
        let document = self.registry.get_document(document_id).await.ok_or_else(|| {
            ApiError::new(
                ErrorCode::NotFound,
                format!("document not found: {}", document_id),
                &ctx.request_id,
            )
        })?;
        let container = self.authorize_container(ctx, &document.container_id).await?;

        let deletion = self
            .registry
            .delete_document(document_id)
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string(), &ctx.request_id))?;

        for chunk in &deletion.removed_chunks {
            let collection = collection_name(&container.id, chunk.modality);
            if let Some((_, to_chunk)) = deletion
                .promotions
                .iter()
                .find(|(from, _)| from == &chunk.id)
            {
                // The surviving duplicate takes over the shared vector row.
                let _ = self.vectors.reassign(&collection, &chunk.id, to_chunk).await;
            } else if chunk.is_canonical() {
                let _ = self.vectors.delete(&collection, &chunk.id).await;
            }
        }

        let removed_ids: Vec<String> = deletion
            .removed_chunks
            .iter()
            .map(|chunk| chunk.id.clone())
            .collect();
        let _ = self
            .graph
            .delete_by_source_chunks(&container.id, &removed_ids)
            .await;
        let _ = self.blobs.delete_document(&container.id, document_id).await;

        self.record_audit(
            ctx,
            AuditOperation::Lifecycle,
            AuditOutcome::Succeeded,
            Some(container.id),
        );
        Ok(OpResponse::success(
            &ctx.request_id,
            started.elapsed().as_millis() as u64,
        ))
    }

    // ------------------------------------------------------------------
    // Graph API
    // ------------------------------------------------------------------

    pub async fn graph_upsert(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
        nodes: Vec<GraphNodeInput>,
        edges: Vec<GraphEdgeInput>,
        mode: UpsertMode,
    ) -> Result<GraphUpsertResponse, ApiError> {
        let container = self.authorize_container(ctx, container_ref).await?;

        // Provenance closure: every node and edge must reference a chunk in
        // this container.
        let mut graph_nodes = Vec::new();
        for node in nodes {
            self.check_chunk(ctx, &container.id, &node.source_chunk_id).await?;
            graph_nodes.push(GraphNode {
                id: node.id,
                container_id: container.id.clone(),
                label: node.label,
                node_type: node.node_type,
                summary: node.summary,
                source_chunk_id: node.source_chunk_id,
            });
        }
        let mut graph_edges = Vec::new();
        for edge in edges {
            self.check_chunk(ctx, &container.id, &edge.source_chunk_id).await?;
            graph_edges.push(GraphEdge {
                source: edge.source,
                target: edge.target,
                edge_type: edge.edge_type,
                container_id: container.id.clone(),
                source_chunk_id: edge.source_chunk_id,
            });
        }

        let (nodes_upserted, edges_upserted) = self
            .graph
            .upsert(&container.id, graph_nodes, graph_edges, mode)
            .await
            .map_err(|err| {
                ApiError::new(ErrorCode::InvalidArgument, err.to_string(), &ctx.request_id)
            })?;

        self.record_audit(
            ctx,
            AuditOperation::Graph,
            AuditOutcome::Succeeded,
            Some(container.id),
        );
        Ok(GraphUpsertResponse {
            version: API_VERSION.to_string(),
            request_id: ctx.request_id.clone(),
            nodes_upserted,
            edges_upserted,
        })
    }

    async fn check_chunk(
        &self,
        ctx: &RequestContext,
        container_id: &str,
        chunk_id: &str,
    ) -> Result<(), ApiError> {
        match self.registry.get_chunk(chunk_id).await {
            Some(chunk) if chunk.container_id == container_id => Ok(()),
            Some(_) => Err(ApiError::new(
                ErrorCode::InvalidArgument,
                format!("chunk {} belongs to another container", chunk_id),
                &ctx.request_id,
            )),
            None => Err(ApiError::new(
                ErrorCode::InvalidArgument,
                format!("source_chunk_id {} does not exist", chunk_id),
                &ctx.request_id,
            )),
        }
    }

    pub async fn graph_search(
        &self,
        ctx: &RequestContext,
        request: GraphSearchRequest,
    ) -> Result<GraphSearchOutput, ApiError> {
        self.authorize_container(ctx, &request.container).await?;
        self.engine
            .graph_search(request)
            .await
            .map_err(|err| self.map_retrieval_error(ctx, err))
    }

    pub async fn graph_schema(
        &self,
        ctx: &RequestContext,
        container_ref: &str,
    ) -> Result<GraphSchema, ApiError> {
        let container = self.authorize_container(ctx, container_ref).await?;
        Ok(self.graph.schema(&container.id).await)
    }

    // ------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------

    pub fn system(&self) -> SystemReporter<'_> {
        SystemReporter::new(
            &self.registry,
            &self.vectors,
            &self.blobs,
            &self.graph,
            &self.embeddings,
            &self.metrics,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Adapter wiring point: deployments register their embedder bindings
    /// here before containers pin them.
    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn policies(&self) -> &Arc<PolicyResolver> {
        &self.policies
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddMode {
    Async,
    Blocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSourcesResponse {
    pub version: String,
    pub request_id: String,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub version: String,
    pub request_id: String,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobView {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.state.as_str().to_string(),
            error: if job.state == JobState::Failed {
                job.last_error.clone()
            } else {
                None
            },
            result: job
                .result_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            created_at: rfc3339(job.created_at_ms),
            updated_at: rfc3339(job.updated_at_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerView {
    pub version: String,
    pub request_id: String,
    pub id: String,
    pub slug: String,
    pub theme: String,
    pub state: ContainerState,
    pub manifest: ContainerManifest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContainerStatsView>,
    pub created_at: String,
    pub updated_at: String,
    pub timings_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatsView {
    pub document_count: u64,
    pub chunk_count: u64,
    pub bytes_stored: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ingest_at: Option<String>,
}

impl ContainerView {
    fn from_container(
        container: &Container,
        include_stats: bool,
        timings_ms: u64,
        request_id: &str,
    ) -> Self {
        Self {
            version: API_VERSION.to_string(),
            request_id: request_id.to_string(),
            id: container.id.clone(),
            slug: container.manifest.slug.clone(),
            theme: container.manifest.theme.clone(),
            state: container.state,
            manifest: container.manifest.clone(),
            stats: include_stats.then(|| ContainerStatsView {
                document_count: container.stats.document_count,
                chunk_count: container.stats.chunk_count,
                bytes_stored: container.stats.bytes_stored,
                last_ingest_at: container.stats.last_ingest_ms.map(rfc3339),
            }),
            created_at: rfc3339(container.created_at_ms),
            updated_at: rfc3339(container.updated_at_ms),
            timings_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentView {
    pub id: String,
    pub container_id: String,
    pub uri: String,
    pub mime: String,
    pub title: String,
    pub modality: curio_core::model::Modality,
    pub content_hash: String,
    pub chunk_count: u32,
    pub ingested_at: String,
    pub fetcher: String,
}

impl DocumentView {
    fn from_document(document: &curio_core::model::Document) -> Self {
        Self {
            id: document.id.clone(),
            container_id: document.container_id.clone(),
            uri: document.uri.clone(),
            mime: document.mime.clone(),
            title: document.title.clone(),
            modality: document.modality,
            content_hash: document.content_hash.clone(),
            chunk_count: document.chunk_count,
            ingested_at: rfc3339(document.ingested_at_ms),
            fetcher: document.fetcher.clone(),
        }
    }
}

/// Graph upsert inputs. Ids are coerced to strings at the boundary: a graph
/// store returning numeric ids still round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNodeInput {
    #[serde(deserialize_with = "coerce_string")]
    pub id: String,
    pub label: String,
    pub node_type: String,
    #[serde(default)]
    pub summary: String,
    #[serde(deserialize_with = "coerce_string")]
    pub source_chunk_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdgeInput {
    #[serde(deserialize_with = "coerce_string")]
    pub source: String,
    #[serde(deserialize_with = "coerce_string")]
    pub target: String,
    pub edge_type: String,
    #[serde(deserialize_with = "coerce_string")]
    pub source_chunk_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphUpsertResponse {
    pub version: String,
    pub request_id: String,
    pub nodes_upserted: usize,
    pub edges_upserted: usize,
}

fn coerce_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}
