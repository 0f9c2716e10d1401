use crate::chunker::{ChunkPiece, WindowChunker};
use crate::dedupe::Deduper;
pub use crate::fetch::IngestSource;
use crate::fetch::{FetchError, Fetcher};
use crate::normalize::{detect_modality, normalize, NormalizeError, NormalizedContent};
use adapters::service::EmbeddingService;
use adapters::AdapterError;
use curio_core::manifest::{EmbedderRef, Policy};
use curio_core::model::{
    collection_name, derive_chunk_id, derive_document_id, now_ms, sha256_hex, Chunk, Document,
    DocumentState, JobKind, Modality,
};
use dashmap::DashMap;
use jobs::{JobFailure, JobHandler, JobQueue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::blob::{BlobError, BlobKind, BlobStore};
use storage::policy::{PolicyError, PolicyResolver};
use storage::registry::{Registry, RegistryError, RegistryOp};
use storage::vector::{VectorError, VectorPayload, VectorStore};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJobPayload {
    pub source: IngestSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestOutcome {
    pub document_id: String,
    pub chunks_created: u32,
    pub chunks_deduped: u32,
    pub bytes_stored: u64,
    pub no_op: bool,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("policy rejected: {0}")]
    Policy(#[from] PolicyError),
    #[error("modality {0} not allowed by container policy")]
    ModalityNotAllowed(String),
    #[error("source modality could not be determined")]
    UnknownModality,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("embedding unavailable: {0}")]
    EmbeddingDown(AdapterError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("vector store error: {0}")]
    Vector(#[from] VectorError),
    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),
}

impl IngestError {
    /// Deterministic rejections are permanent; infrastructure faults retry.
    pub fn retryable(&self) -> bool {
        match self {
            IngestError::Policy(_)
            | IngestError::ModalityNotAllowed(_)
            | IngestError::UnknownModality
            | IngestError::Normalize(_)
            | IngestError::Fetch(FetchError::Permanent(_)) => false,
            IngestError::Fetch(FetchError::Transient(_))
            | IngestError::EmbeddingDown(_)
            | IngestError::Registry(_)
            | IngestError::Vector(_)
            | IngestError::Blob(_) => true,
        }
    }
}

/// The ingest job handler: fetch, normalize, chunk, dedupe, embed, then fan
/// out writes. The registry commit comes first; vector and blob upserts are
/// idempotent by chunk/document id so a crash in between heals on retry.
pub struct IngestProcessor {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
    blobs: Arc<BlobStore>,
    policies: Arc<PolicyResolver>,
    embeddings: Arc<EmbeddingService>,
    queue: Arc<JobQueue>,
    fetcher: Fetcher,
    deduper: Deduper,
    embedding_cache_ttl_s: u64,
    /// In-flight guard per (container, content hash); concurrent duplicate
    /// sources serialize here instead of racing the registry.
    inflight: DashMap<String, ()>,
}

impl IngestProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        vectors: Arc<VectorStore>,
        blobs: Arc<BlobStore>,
        policies: Arc<PolicyResolver>,
        embeddings: Arc<EmbeddingService>,
        queue: Arc<JobQueue>,
        http_timeout: Duration,
        embedding_cache_ttl_s: u64,
    ) -> Self {
        Self {
            fetcher: Fetcher::new(blobs.clone(), http_timeout),
            deduper: Deduper::new(registry.clone(), vectors.clone()),
            registry,
            vectors,
            blobs,
            policies,
            embeddings,
            queue,
            embedding_cache_ttl_s,
            inflight: DashMap::new(),
        }
    }

    pub async fn ingest(
        &self,
        container_ref: &str,
        source: &IngestSource,
        agent_id: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let policy = self.policies.resolve(container_ref, None).await?;

        // Cheap pre-check on the hint; the authoritative check runs after
        // fetch when the mime is known.
        if let Some(hint) = source.modality {
            if !policy.modalities.contains(&hint) {
                return Err(IngestError::ModalityNotAllowed(hint.as_str().to_string()));
            }
        }

        let fetched = self.fetcher.fetch(source).await?;
        let modality = detect_modality(
            source.modality,
            fetched.mime.as_deref().or(source.mime.as_deref()),
            &fetched.uri,
        )
        .ok_or(IngestError::UnknownModality)?;
        if !policy.modalities.contains(&modality) {
            return Err(IngestError::ModalityNotAllowed(
                modality.as_str().to_string(),
            ));
        }

        let normalized = normalize(modality, &fetched.bytes, policy.thumbnail_max_edge)?;
        let content_hash = sha256_hex(&normalized.canonical_bytes);

        let guard_key = format!("{}:{}", policy.container_id, content_hash);
        let _guard = InflightGuard::acquire(&self.inflight, guard_key).await;

        // Identical active source: no-op referencing the original document.
        // A crash between the registry commit and the vector/blob upserts
        // lands a retry here, so the no-op path repairs missing rows.
        if let Some(existing) = self
            .registry
            .find_document_by_hash(&policy.container_id, &content_hash)
            .await
        {
            if existing.state == DocumentState::Active {
                debug!(document_id = %existing.id, "re-ingest of identical source is a no-op");
                self.heal(&policy, &existing, &normalized).await?;
                return Ok(IngestOutcome {
                    document_id: existing.id,
                    chunks_created: 0,
                    chunks_deduped: 0,
                    bytes_stored: 0,
                    no_op: true,
                });
            }
        }

        let document_id = derive_document_id(&policy.container_id, &content_hash);
        let ingested_at = now_ms();
        let title = source
            .title
            .clone()
            .unwrap_or_else(|| title_from_uri(&fetched.uri));

        let pieces = self.chunk_pieces(&policy, &normalized);
        let outcome = self
            .write_document(
                &policy,
                &normalized,
                WriteRequest {
                    document_id: &document_id,
                    uri: &fetched.uri,
                    mime: fetched.mime.as_deref().unwrap_or("application/octet-stream"),
                    fetcher: &fetched.fetcher,
                    title: &title,
                    content_hash: &content_hash,
                    ingested_at,
                },
                pieces,
            )
            .await?;

        if policy.graph.is_some() && modality != Modality::Image {
            let payload = crate::graph_build::GraphExtractPayload {
                document_id: document_id.clone(),
            };
            if let Err(err) = self
                .queue
                .enqueue(
                    JobKind::GraphExtract,
                    &policy.container_id,
                    &payload,
                    Some(format!("graph_extract:{}", document_id)),
                    agent_id.map(|a| a.to_string()),
                )
                .await
            {
                // Graph extraction is best-effort; ingestion already
                // committed.
                warn!(document_id = %document_id, "failed to enqueue graph extraction: {}", err);
            }
        }

        if let Some(agent) = agent_id {
            let _ = self
                .registry
                .put_subscription(policy.container_id.clone(), agent.to_string(), ingested_at)
                .await;
        }

        info!(
            container_id = %policy.container_id,
            document_id = %document_id,
            chunks_created = outcome.chunks_created,
            chunks_deduped = outcome.chunks_deduped,
            "ingest committed"
        );
        Ok(outcome)
    }

    fn chunk_pieces(&self, policy: &Policy, normalized: &NormalizedContent) -> Vec<ChunkPiece> {
        match &normalized.text {
            Some(text) => WindowChunker::new(policy.chunk_max_chars, policy.chunk_overlap_chars)
                .chunk(&text.text, &text.pages),
            // One chunk covers the whole image.
            None => vec![ChunkPiece {
                ordinal: 0,
                text: String::new(),
                char_start: 0,
                char_end: 0,
                page: None,
            }],
        }
    }

    async fn write_document(
        &self,
        policy: &Policy,
        normalized: &NormalizedContent,
        request: WriteRequest<'_>,
        pieces: Vec<ChunkPiece>,
    ) -> Result<IngestOutcome, IngestError> {
        let collection = collection_name(&policy.container_id, normalized.modality);
        // Defensive: lifecycle creates collections, but a container predating
        // an added modality may not have one yet.
        self.vectors
            .create_collection(&collection, policy.embedder.dims)
            .await?;

        // Pass 1: exact dedup by text hash.
        let mut dedup_of: HashMap<u32, String> = HashMap::new();
        for piece in pieces.iter().filter(|p| !p.text.is_empty()) {
            if let Some(canonical) = self.deduper.exact(&policy.container_id, &piece.text).await {
                if canonical.document_id != request.document_id {
                    dedup_of.insert(piece.ordinal, canonical.id);
                }
            }
        }

        // Pass 2: embed what survived exact dedup (cache first), then
        // semantic dedup against existing vectors.
        let mut vectors_by_ordinal: HashMap<u32, Vec<f32>> = HashMap::new();
        match normalized.modality {
            Modality::Image => {
                if let Some(image) = normalized.image.as_ref() {
                    let vector = self
                        .embeddings
                        .embed_image(&policy.embedder, &image.original, true)
                        .await
                        .map_err(IngestError::EmbeddingDown)?;
                    vectors_by_ordinal.insert(0, vector);
                }
            }
            _ => {
                let pending: Vec<(u32, String)> = pieces
                    .iter()
                    .filter(|p| !p.text.is_empty() && !dedup_of.contains_key(&p.ordinal))
                    .map(|p| (p.ordinal, p.text.clone()))
                    .collect();
                let embedded = self.embed_with_cache(&policy.embedder, &pending).await?;
                vectors_by_ordinal.extend(embedded);
            }
        }

        for piece in &pieces {
            if dedup_of.contains_key(&piece.ordinal) {
                continue;
            }
            let Some(vector) = vectors_by_ordinal.get(&piece.ordinal) else {
                continue;
            };
            if let Some((canonical_id, score)) = self
                .deduper
                .semantic(&collection, vector, policy.semantic_threshold)
                .await
            {
                debug!(ordinal = piece.ordinal, score, "semantic dedup hit");
                dedup_of.insert(piece.ordinal, canonical_id);
            }
        }

        // Registry transaction: document, chunks, stats.
        let bytes_stored = normalized.canonical_bytes.len() as u64;
        let document = Document {
            id: request.document_id.to_string(),
            container_id: policy.container_id.clone(),
            uri: request.uri.to_string(),
            mime: request.mime.to_string(),
            content_hash: request.content_hash.to_string(),
            title: request.title.to_string(),
            modality: normalized.modality,
            ingested_at_ms: request.ingested_at,
            fetcher: request.fetcher.to_string(),
            original_path: None,
            chunk_count: pieces.len() as u32,
            state: DocumentState::Active,
        };

        let mut ops = vec![RegistryOp::PutDocument(document.clone())];
        let mut chunks = Vec::new();
        for piece in &pieces {
            let chunk = Chunk {
                id: derive_chunk_id(request.document_id, piece.ordinal),
                document_id: request.document_id.to_string(),
                container_id: policy.container_id.clone(),
                modality: normalized.modality,
                ordinal: piece.ordinal,
                text: piece.text.clone(),
                char_start: piece.char_start,
                char_end: piece.char_end,
                page: piece.page,
                dedup_of: dedup_of.get(&piece.ordinal).cloned(),
                embedder_id: policy.embedder.id.clone(),
                embedder_version: policy.embedder.version.clone(),
                created_at_ms: request.ingested_at,
            };
            ops.push(RegistryOp::PutChunk(chunk.clone()));
            chunks.push(chunk);
        }
        ops.push(RegistryOp::BumpStats {
            container_id: policy.container_id.clone(),
            docs_delta: 1,
            chunks_delta: chunks.len() as i64,
            bytes_delta: bytes_stored as i64,
            last_ingest_ms: Some(request.ingested_at),
        });
        self.registry.apply(ops).await?;

        // Idempotent fan-out: vectors for canonical chunks, blobs for the
        // artifact.
        for chunk in chunks.iter().filter(|c| c.is_canonical()) {
            if let Some(vector) = vectors_by_ordinal.get(&chunk.ordinal) {
                self.vectors
                    .upsert(
                        &collection,
                        &chunk.id,
                        vector.clone(),
                        VectorPayload {
                            container_id: policy.container_id.clone(),
                            document_id: request.document_id.to_string(),
                            modality: chunk.modality,
                            title: request.title.to_string(),
                            uri: request.uri.to_string(),
                            ingested_at_ms: request.ingested_at,
                        },
                    )
                    .await?;
            }
        }

        self.blobs
            .put(
                &policy.container_id,
                request.document_id,
                BlobKind::Original,
                &normalized.canonical_bytes,
            )
            .await?;
        if let Some(image) = &normalized.image {
            self.blobs
                .put(
                    &policy.container_id,
                    request.document_id,
                    BlobKind::Thumb,
                    &image.thumbnail,
                )
                .await?;
        }

        let chunks_deduped = chunks.iter().filter(|c| !c.is_canonical()).count() as u32;
        Ok(IngestOutcome {
            document_id: request.document_id.to_string(),
            chunks_created: chunks.len() as u32,
            chunks_deduped,
            bytes_stored,
            no_op: false,
        })
    }

    /// Repair pass for re-ingest of an already-active document: re-upsert
    /// any vector row or blob a previous attempt failed to land. Upserts are
    /// keyed by chunk and document id, so this is idempotent.
    async fn heal(
        &self,
        policy: &Policy,
        document: &Document,
        normalized: &NormalizedContent,
    ) -> Result<(), IngestError> {
        let collection = collection_name(&policy.container_id, document.modality);
        self.vectors
            .create_collection(&collection, policy.embedder.dims)
            .await?;

        let chunks = self.registry.chunks_by_document(&document.id).await;
        for chunk in chunks.iter().filter(|c| c.is_canonical()) {
            if self.vectors.get(&collection, &chunk.id).await.is_some() {
                continue;
            }

            let vector = match document.modality {
                Modality::Image => match normalized.image.as_ref() {
                    Some(image) => self
                        .embeddings
                        .embed_image(&policy.embedder, &image.original, true)
                        .await
                        .map_err(IngestError::EmbeddingDown)?,
                    None => continue,
                },
                _ => {
                    let embedded = self
                        .embed_with_cache(
                            &policy.embedder,
                            &[(chunk.ordinal, chunk.text.clone())],
                        )
                        .await?;
                    match embedded.into_values().next() {
                        Some(vector) => vector,
                        None => continue,
                    }
                }
            };

            warn!(chunk_id = %chunk.id, "healing missing vector row");
            self.vectors
                .upsert(
                    &collection,
                    &chunk.id,
                    vector,
                    VectorPayload {
                        container_id: policy.container_id.clone(),
                        document_id: document.id.clone(),
                        modality: chunk.modality,
                        title: document.title.clone(),
                        uri: document.uri.clone(),
                        ingested_at_ms: document.ingested_at_ms,
                    },
                )
                .await?;
        }

        if !self
            .blobs
            .exists(&policy.container_id, &document.id, BlobKind::Original)
            .await
        {
            self.blobs
                .put(
                    &policy.container_id,
                    &document.id,
                    BlobKind::Original,
                    &normalized.canonical_bytes,
                )
                .await?;
        }
        if let Some(image) = &normalized.image {
            if !self
                .blobs
                .exists(&policy.container_id, &document.id, BlobKind::Thumb)
                .await
            {
                self.blobs
                    .put(
                        &policy.container_id,
                        &document.id,
                        BlobKind::Thumb,
                        &image.thumbnail,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    async fn embed_with_cache(
        &self,
        embedder: &EmbedderRef,
        pending: &[(u32, String)],
    ) -> Result<HashMap<u32, Vec<f32>>, IngestError> {
        let now = now_ms();
        let mut out = HashMap::new();
        let mut misses: Vec<(u32, String, String)> = Vec::new(); // ordinal, key, text

        for (ordinal, text) in pending {
            let key = format!(
                "{}:{}:{}",
                sha256_hex(text.as_bytes()),
                embedder.id,
                embedder.version
            );
            match self.registry.embedding_cache_get(&key, now).await {
                Some(vector) => {
                    out.insert(*ordinal, vector);
                }
                None => misses.push((*ordinal, key, text.clone())),
            }
        }

        if misses.is_empty() {
            return Ok(out);
        }

        let texts: Vec<String> = misses.iter().map(|(_, _, text)| text.clone()).collect();
        let vectors = self
            .embeddings
            .embed_texts(embedder, &texts, true)
            .await
            .map_err(IngestError::EmbeddingDown)?;

        for ((ordinal, key, _), vector) in misses.into_iter().zip(vectors) {
            // Cache writes are best-effort.
            let _ = self
                .registry
                .embedding_cache_put(key, vector.clone(), self.embedding_cache_ttl_s, now)
                .await;
            out.insert(ordinal, vector);
        }

        Ok(out)
    }
}

struct WriteRequest<'a> {
    document_id: &'a str,
    uri: &'a str,
    mime: &'a str,
    fetcher: &'a str,
    title: &'a str,
    content_hash: &'a str,
    ingested_at: i64,
}

fn title_from_uri(uri: &str) -> String {
    uri.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(uri)
        .to_string()
}

struct InflightGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl<'a> InflightGuard<'a> {
    async fn acquire(map: &'a DashMap<String, ()>, key: String) -> InflightGuard<'a> {
        loop {
            match map.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(());
                    return InflightGuard { map, key };
                }
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    // Release the shard lock before sleeping.
                    drop(occupied);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[async_trait::async_trait]
impl JobHandler for IngestProcessor {
    fn kind(&self) -> JobKind {
        JobKind::Ingest
    }

    async fn execute(
        &self,
        job: &curio_core::model::Job,
    ) -> Result<serde_json::Value, JobFailure> {
        let payload: IngestJobPayload = serde_json::from_str(&job.payload_json)
            .map_err(|err| JobFailure::permanent(anyhow::anyhow!("bad payload: {}", err)))?;

        match self
            .ingest(&job.container_id, &payload.source, job.agent_id.as_deref())
            .await
        {
            Ok(outcome) => Ok(serde_json::to_value(outcome)
                .map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))?),
            Err(err) if err.retryable() => Err(JobFailure::retryable(anyhow::anyhow!(err))),
            Err(err) => Err(JobFailure::permanent(anyhow::anyhow!(err))),
        }
    }
}
