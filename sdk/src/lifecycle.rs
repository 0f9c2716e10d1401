use adapters::service::EmbeddingService;
use curio_core::error::{CurioError, ErrorCode};
use curio_core::manifest::{
    ContainerManifest, GraphPolicy, RerankPolicy, Visibility,
};
use curio_core::model::{
    collection_name, derive_container_id, now_ms, sha256_hex, Container, ContainerState, Job,
    JobKind, Modality,
};
use jobs::{JobFailure, JobHandler, JobQueue};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use storage::blob::BlobStore;
use storage::graph_store::GraphStore;
use storage::policy::PolicyResolver;
use storage::registry::{ContainerFilter, Registry, RegistryError, RegistryOp};
use storage::vector::VectorStore;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl CurioError for LifecycleError {
    fn error_code(&self) -> ErrorCode {
        match self {
            LifecycleError::NotFound(_) => ErrorCode::NotFound,
            LifecycleError::Invalid(_) => ErrorCode::InvalidArgument,
            LifecycleError::Conflict(_) => ErrorCode::Conflict,
            LifecycleError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<RegistryError> for LifecycleError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => LifecycleError::NotFound(id),
            RegistryError::Conflict(msg) => LifecycleError::Conflict(msg),
            RegistryError::InvalidTransaction(msg) => LifecycleError::Invalid(msg),
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}

/// Mutable manifest surface for update-metadata. Slug and embedder identity
/// are immutable; only a shadow refresh may change the embedder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestPatch {
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub modalities: Option<Vec<Modality>>,
    #[serde(default)]
    pub latency_budget_ms: Option<u64>,
    #[serde(default)]
    pub rerank: Option<RerankPolicy>,
    #[serde(default)]
    pub freshness_lambda: Option<f32>,
    #[serde(default)]
    pub graph: Option<GraphPolicy>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub acl: Option<Vec<String>>,
    #[serde(default)]
    pub semantic_dedup_threshold: Option<f32>,
    #[serde(default)]
    pub snippet_max_chars: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshPayload {
    pub embedder_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPayload {
    #[serde(default)]
    pub include_vectors: bool,
    #[serde(default)]
    pub include_blobs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub artifact_id: String,
    pub artifact_key: String,
    pub documents: usize,
    pub chunks: usize,
}

/// Container lifecycle: create, describe, list, update, delete, and the
/// queued refresh/export operations.
pub struct Lifecycle {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
    blobs: Arc<BlobStore>,
    graph: Arc<GraphStore>,
    policies: Arc<PolicyResolver>,
    queue: Arc<JobQueue>,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<Registry>,
        vectors: Arc<VectorStore>,
        blobs: Arc<BlobStore>,
        graph: Arc<GraphStore>,
        policies: Arc<PolicyResolver>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            registry,
            vectors,
            blobs,
            graph,
            policies,
            queue,
        }
    }

    pub async fn create(&self, manifest: ContainerManifest) -> Result<Container, LifecycleError> {
        manifest
            .validate()
            .map_err(|err| LifecycleError::Invalid(err.to_string()))?;
        if self.registry.find_container(&manifest.slug).await.is_some() {
            return Err(LifecycleError::Conflict(format!(
                "slug {} already in use",
                manifest.slug
            )));
        }

        let now = now_ms();
        let container = Container {
            id: derive_container_id(&manifest.slug, now),
            manifest,
            state: ContainerState::Active,
            stats: Default::default(),
            created_at_ms: now,
            updated_at_ms: now,
        };

        self.registry
            .apply(vec![RegistryOp::PutContainer(container.clone())])
            .await?;

        // One collection per modality family, named deterministically so
        // ingest retries land in the same place.
        self.vectors
            .create_collection(
                &container.collection_name(Modality::Text),
                container.manifest.embedder.dims,
            )
            .await
            .map_err(|err| LifecycleError::Internal(err.to_string()))?;
        if container.manifest.allows_modality(Modality::Image) {
            self.vectors
                .create_collection(
                    &container.collection_name(Modality::Image),
                    container.manifest.embedder.dims,
                )
                .await
                .map_err(|err| LifecycleError::Internal(err.to_string()))?;
        }

        info!(container_id = %container.id, slug = %container.manifest.slug, "container created");
        Ok(container)
    }

    pub async fn describe(&self, container_ref: &str) -> Result<Container, LifecycleError> {
        self.registry
            .find_container(container_ref)
            .await
            .ok_or_else(|| LifecycleError::NotFound(container_ref.to_string()))
    }

    pub async fn list(&self, filter: &ContainerFilter) -> Vec<Container> {
        self.registry.list_containers(filter).await
    }

    pub async fn update(
        &self,
        container_ref: &str,
        patch: ManifestPatch,
    ) -> Result<Container, LifecycleError> {
        let mut container = self.describe(container_ref).await?;
        apply_patch(&mut container.manifest, patch);
        container
            .manifest
            .validate()
            .map_err(|err| LifecycleError::Invalid(err.to_string()))?;
        container.updated_at_ms = now_ms();

        self.registry
            .apply(vec![RegistryOp::PutContainer(container.clone())])
            .await?;
        // Any manifest mutation invalidates the cached policy.
        self.policies.invalidate(&container).await;
        Ok(container)
    }

    pub async fn set_state(
        &self,
        container_ref: &str,
        state: ContainerState,
    ) -> Result<Container, LifecycleError> {
        let mut container = self.describe(container_ref).await?;
        container.state = state;
        container.updated_at_ms = now_ms();
        self.registry
            .apply(vec![RegistryOp::PutContainer(container.clone())])
            .await?;
        self.policies.invalidate(&container).await;
        Ok(container)
    }

    /// Soft delete archives; hard delete cascades to chunks, vectors, blobs,
    /// graph, links, and subscriptions.
    pub async fn delete(&self, container_ref: &str, hard: bool) -> Result<(), LifecycleError> {
        let container = self.describe(container_ref).await?;

        if !hard {
            self.set_state(&container.id, ContainerState::Archived).await?;
            return Ok(());
        }

        self.registry
            .apply(vec![RegistryOp::DeleteContainer {
                container_id: container.id.clone(),
            }])
            .await?;
        for collection in [
            container.collection_name(Modality::Text),
            container.collection_name(Modality::Image),
            shadow_collection(&container.id),
        ] {
            self.vectors
                .drop_collection(&collection)
                .await
                .map_err(|err| LifecycleError::Internal(err.to_string()))?;
        }
        self.blobs
            .delete_container(&container.id)
            .await
            .map_err(|err| LifecycleError::Internal(err.to_string()))?;
        self.graph
            .delete_container(&container.id)
            .await
            .map_err(|err| LifecycleError::Internal(err.to_string()))?;
        self.policies.invalidate(&container).await;

        info!(container_id = %container.id, "container hard-deleted");
        Ok(())
    }

    pub async fn refresh(
        &self,
        container_ref: &str,
        embedder_version: String,
        agent_id: Option<String>,
    ) -> Result<Job, LifecycleError> {
        let container = self.describe(container_ref).await?;
        let payload = RefreshPayload {
            embedder_version: embedder_version.clone(),
        };
        self.queue
            .enqueue(
                JobKind::Refresh,
                &container.id,
                &payload,
                Some(format!("refresh:{}:{}", container.id, embedder_version)),
                agent_id,
            )
            .await
            .map_err(|err| LifecycleError::Internal(err.to_string()))
    }

    pub async fn export(
        &self,
        container_ref: &str,
        payload: ExportPayload,
        agent_id: Option<String>,
    ) -> Result<Job, LifecycleError> {
        let container = self.describe(container_ref).await?;
        self.queue
            .enqueue(JobKind::Export, &container.id, &payload, None, agent_id)
            .await
            .map_err(|err| LifecycleError::Internal(err.to_string()))
    }
}

fn apply_patch(manifest: &mut ContainerManifest, patch: ManifestPatch) {
    if let Some(theme) = patch.theme {
        manifest.theme = theme;
    }
    if let Some(description) = patch.description {
        manifest.description = description;
    }
    if let Some(modalities) = patch.modalities {
        manifest.modalities = modalities;
    }
    if let Some(budget) = patch.latency_budget_ms {
        manifest.latency_budget_ms = budget;
    }
    if let Some(rerank) = patch.rerank {
        manifest.rerank = rerank;
    }
    if let Some(lambda) = patch.freshness_lambda {
        manifest.freshness_lambda = lambda;
    }
    if let Some(graph) = patch.graph {
        manifest.graph = graph;
    }
    if let Some(visibility) = patch.visibility {
        manifest.visibility = visibility;
    }
    if let Some(acl) = patch.acl {
        manifest.acl = acl;
    }
    if let Some(threshold) = patch.semantic_dedup_threshold {
        manifest.semantic_dedup_threshold = threshold;
    }
    if let Some(snippet) = patch.snippet_max_chars {
        manifest.snippet_max_chars = snippet;
    }
}

pub fn shadow_collection(container_id: &str) -> String {
    format!("{}__shadow", collection_name(container_id, Modality::Text))
}

/// Shadow refresh: build a new text collection under the new embedder
/// version, then swap atomically. The only path that may change embedder
/// identity on a live container.
pub struct RefreshProcessor {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
    embeddings: Arc<EmbeddingService>,
    policies: Arc<PolicyResolver>,
}

impl RefreshProcessor {
    pub fn new(
        registry: Arc<Registry>,
        vectors: Arc<VectorStore>,
        embeddings: Arc<EmbeddingService>,
        policies: Arc<PolicyResolver>,
    ) -> Self {
        Self {
            registry,
            vectors,
            embeddings,
            policies,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for RefreshProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Refresh
    }

    async fn execute(&self, job: &Job) -> Result<serde_json::Value, JobFailure> {
        let payload: RefreshPayload = serde_json::from_str(&job.payload_json)
            .map_err(|err| JobFailure::permanent(anyhow::anyhow!("bad payload: {}", err)))?;

        let Some(mut container) = self.registry.get_container(&job.container_id).await else {
            return Err(JobFailure::permanent(anyhow::anyhow!(
                "container {} vanished",
                job.container_id
            )));
        };

        let mut new_embedder = container.manifest.embedder.clone();
        new_embedder.version = payload.embedder_version.clone();

        let shadow = shadow_collection(&container.id);
        let target = container.collection_name(Modality::Text);
        // Restarted refreshes rebuild the shadow from scratch.
        self.vectors
            .drop_collection(&shadow)
            .await
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;
        self.vectors
            .create_collection(&shadow, new_embedder.dims)
            .await
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;

        let chunks = self.registry.chunks_by_container(&container.id).await;
        let mut reembedded = 0usize;
        let mut chunk_updates = Vec::new();
        for chunk in chunks
            .iter()
            .filter(|c| c.is_canonical() && !c.text.is_empty())
        {
            let vectors = self
                .embeddings
                .embed_texts(&new_embedder, &[chunk.text.clone()], true)
                .await
                .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;
            let Some((vector, payload)) = vectors.into_iter().next().zip(
                self.vectors
                    .get(&target, &chunk.id)
                    .await
                    .map(|(_, payload)| payload),
            ) else {
                continue;
            };

            self.vectors
                .upsert(&shadow, &chunk.id, vector, payload)
                .await
                .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;
            reembedded += 1;

            let mut updated = chunk.clone();
            updated.embedder_version = new_embedder.version.clone();
            chunk_updates.push(RegistryOp::PutChunk(updated));
        }

        // Swap, then persist the new embedder identity.
        self.vectors
            .swap_collections(&shadow, &target)
            .await
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;

        container.manifest.embedder = new_embedder;
        container.updated_at_ms = now_ms();
        chunk_updates.push(RegistryOp::PutContainer(container.clone()));
        self.registry
            .apply(chunk_updates)
            .await
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;
        self.policies.invalidate(&container).await;

        info!(container_id = %container.id, reembedded, "shadow refresh swapped");
        Ok(serde_json::json!({ "chunks_reembedded": reembedded }))
    }
}

/// Content-addressed export: manifest + documents + chunks (and optionally
/// vectors and blobs) packaged as a tar in the blob store.
pub struct ExportProcessor {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
    blobs: Arc<BlobStore>,
}

impl ExportProcessor {
    pub fn new(registry: Arc<Registry>, vectors: Arc<VectorStore>, blobs: Arc<BlobStore>) -> Self {
        Self {
            registry,
            vectors,
            blobs,
        }
    }

    fn append_file(
        builder: &mut tar::Builder<Vec<u8>>,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), JobFailure> {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, bytes)
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))
    }
}

#[async_trait::async_trait]
impl JobHandler for ExportProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Export
    }

    async fn execute(&self, job: &Job) -> Result<serde_json::Value, JobFailure> {
        let payload: ExportPayload = serde_json::from_str(&job.payload_json)
            .map_err(|err| JobFailure::permanent(anyhow::anyhow!("bad payload: {}", err)))?;

        let Some(container) = self.registry.get_container(&job.container_id).await else {
            return Err(JobFailure::permanent(anyhow::anyhow!(
                "container {} vanished",
                job.container_id
            )));
        };

        let documents = self.registry.list_documents(&container.id).await;
        let chunks = self.registry.chunks_by_container(&container.id).await;

        let mut builder = tar::Builder::new(Vec::new());

        let manifest_json = serde_json::to_vec_pretty(&container)
            .map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))?;
        Self::append_file(&mut builder, "manifest.json", &manifest_json)?;

        let mut documents_jsonl = Vec::new();
        for document in &documents {
            serde_json::to_writer(&mut documents_jsonl, document)
                .map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))?;
            documents_jsonl.write_all(b"\n").ok();
        }
        Self::append_file(&mut builder, "documents.jsonl", &documents_jsonl)?;

        let mut chunks_jsonl = Vec::new();
        for chunk in &chunks {
            serde_json::to_writer(&mut chunks_jsonl, chunk)
                .map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))?;
            chunks_jsonl.write_all(b"\n").ok();
        }
        Self::append_file(&mut builder, "chunks.jsonl", &chunks_jsonl)?;

        if payload.include_vectors {
            let mut vectors_jsonl = Vec::new();
            for modality in [Modality::Text, Modality::Image] {
                let collection = container.collection_name(modality);
                for (chunk_id, vector, row_payload) in self.vectors.rows(&collection).await {
                    let row = serde_json::json!({
                        "collection": collection,
                        "chunk_id": chunk_id,
                        "vector": vector,
                        "payload": row_payload,
                    });
                    serde_json::to_writer(&mut vectors_jsonl, &row)
                        .map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))?;
                    vectors_jsonl.write_all(b"\n").ok();
                }
            }
            Self::append_file(&mut builder, "vectors.jsonl", &vectors_jsonl)?;
        }

        if payload.include_blobs {
            for document in &documents {
                if let Ok(bytes) = self
                    .blobs
                    .get(&container.id, &document.id, storage::blob::BlobKind::Original)
                    .await
                {
                    let path = format!("blobs/{}/original", document.id);
                    Self::append_file(&mut builder, &path, &bytes)?;
                }
            }
        }

        let tar_bytes = builder
            .into_inner()
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;
        let artifact_id = sha256_hex(&tar_bytes)[..16].to_string();
        let artifact_key = self
            .blobs
            .put_export(&artifact_id, &tar_bytes)
            .await
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;

        info!(
            container_id = %container.id,
            artifact_key = %artifact_key,
            documents = documents.len(),
            chunks = chunks.len(),
            "export packaged"
        );

        let outcome = ExportOutcome {
            artifact_id,
            artifact_key,
            documents: documents.len(),
            chunks: chunks.len(),
        };
        serde_json::to_value(outcome).map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))
    }
}
