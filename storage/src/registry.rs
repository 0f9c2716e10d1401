use crate::backup::{BackupError, BackupStore};
use crate::index::Bm25Index;
use crate::journal::{Journal, JournalError};
use curio_core::model::{
    sha256_hex, Chunk, Container, ContainerState, Document, DocumentState, Job, JobEvent, JobKind,
    JobState, Modality,
};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Serialization error")]
    Serialization,
    #[error("Deserialization error")]
    Deserialization,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("backup store is not configured")]
    BackupNotConfigured,
    #[error("backup error: {0}")]
    Backup(#[from] BackupError),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct EmbeddingCacheEntry {
    pub key: String,
    pub vector: Vec<f32>,
    pub created_at_ms: i64,
    pub ttl_s: u64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub struct RerankCacheEntry {
    pub key: String,
    pub scores: Vec<f32>,
    pub created_at_ms: i64,
    pub ttl_s: u64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ContainerLink {
    pub parent_id: String,
    pub child_id: String,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ContainerSubscription {
    pub container_id: String,
    pub agent_id: String,
    pub created_at_ms: i64,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct AgentSession {
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub last_seen_ms: i64,
}

/// One mutation against the registry. A journal frame holds the full
/// transaction so replay applies all-or-nothing.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum RegistryOp {
    PutContainer(Container),
    DeleteContainer { container_id: String },
    PutDocument(Document),
    DeleteDocument { document_id: String },
    PutChunk(Chunk),
    BumpStats {
        container_id: String,
        docs_delta: i64,
        chunks_delta: i64,
        bytes_delta: i64,
        last_ingest_ms: Option<i64>,
    },
    PutJob(Job),
    AppendJobEvent(JobEvent),
    PutEmbeddingCache(EmbeddingCacheEntry),
    PutRerankCache(RerankCacheEntry),
    SweepCaches { now_ms: i64 },
    PutLink(ContainerLink),
    PutSubscription(ContainerSubscription),
    PutAgentSession(AgentSession),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
enum TxRecord {
    Transaction(Vec<RegistryOp>),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
struct RegistryBackup {
    lsn: u64,
    containers: Vec<Container>,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
    jobs: Vec<Job>,
    job_events: Vec<JobEvent>,
    embedding_cache: Vec<EmbeddingCacheEntry>,
    rerank_cache: Vec<RerankCacheEntry>,
    links: Vec<ContainerLink>,
    subscriptions: Vec<ContainerSubscription>,
    agent_sessions: Vec<AgentSession>,
}

/// Filters for the container list operation.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub state: Option<ContainerState>,
    pub search: Option<String>,
    pub parent: Option<String>,
}

/// Result of a document removal, carrying the vector-row moves the caller
/// must mirror into the vector store.
#[derive(Debug, Clone)]
pub struct DocumentDeletion {
    pub document: Document,
    pub removed_chunks: Vec<Chunk>,
    /// (old canonical chunk id, promoted chunk id): the vector row moves to
    /// the promoted peer so surviving duplicates keep their shared vector.
    pub promotions: Vec<(String, String)>,
}

#[derive(Default)]
struct MaterializedState {
    containers: HashMap<String, Container>,
    slug_index: HashMap<String, String>,
    documents: HashMap<String, Document>,
    doc_by_hash: HashMap<(String, String), String>,
    chunks: HashMap<String, Chunk>,
    chunks_by_doc: HashMap<String, Vec<String>>,
    /// (container id, chunk text hash) -> canonical chunk id, for exact dedup.
    text_hash_index: HashMap<(String, String), String>,
    /// canonical chunk id -> chunks deduped onto it.
    dedup_dependents: HashMap<String, Vec<String>>,
    text_indexes: HashMap<String, Bm25Index>,
    jobs: HashMap<String, Job>,
    jobs_by_idem: HashMap<String, String>,
    job_events: Vec<JobEvent>,
    job_event_seq: u64,
    embedding_cache: HashMap<String, EmbeddingCacheEntry>,
    rerank_cache: HashMap<String, RerankCacheEntry>,
    links: Vec<ContainerLink>,
    subscriptions: Vec<ContainerSubscription>,
    agent_sessions: HashMap<String, AgentSession>,
}

impl MaterializedState {
    fn apply(&mut self, op: &RegistryOp) {
        match op {
            RegistryOp::PutContainer(container) => {
                self.slug_index
                    .insert(container.manifest.slug.clone(), container.id.clone());
                self.text_indexes
                    .entry(container.id.clone())
                    .or_default();
                self.containers.insert(container.id.clone(), container.clone());
            }
            RegistryOp::DeleteContainer { container_id } => {
                if let Some(container) = self.containers.remove(container_id) {
                    self.slug_index.remove(&container.manifest.slug);
                }
                self.text_indexes.remove(container_id);
                let doc_ids: Vec<String> = self
                    .documents
                    .values()
                    .filter(|d| &d.container_id == container_id)
                    .map(|d| d.id.clone())
                    .collect();
                for doc_id in doc_ids {
                    self.remove_document(&doc_id);
                }
                self.links
                    .retain(|l| &l.parent_id != container_id && &l.child_id != container_id);
                self.subscriptions
                    .retain(|s| &s.container_id != container_id);
            }
            RegistryOp::PutDocument(document) => {
                let hash_key = (document.container_id.clone(), document.content_hash.clone());
                match document.state {
                    DocumentState::Active => {
                        self.doc_by_hash.insert(hash_key, document.id.clone());
                    }
                    DocumentState::Deleted => {
                        self.doc_by_hash.remove(&hash_key);
                    }
                }
                self.documents.insert(document.id.clone(), document.clone());
            }
            RegistryOp::DeleteDocument { document_id } => {
                self.remove_document(document_id);
            }
            RegistryOp::PutChunk(chunk) => {
                self.insert_chunk(chunk.clone());
            }
            RegistryOp::BumpStats {
                container_id,
                docs_delta,
                chunks_delta,
                bytes_delta,
                last_ingest_ms,
            } => {
                if let Some(container) = self.containers.get_mut(container_id) {
                    let stats = &mut container.stats;
                    stats.document_count = add_delta(stats.document_count, *docs_delta);
                    stats.chunk_count = add_delta(stats.chunk_count, *chunks_delta);
                    stats.bytes_stored = add_delta(stats.bytes_stored, *bytes_delta);
                    if last_ingest_ms.is_some() {
                        stats.last_ingest_ms = *last_ingest_ms;
                    }
                }
            }
            RegistryOp::PutJob(job) => {
                if let Some(key) = &job.idempotency_key {
                    self.jobs_by_idem.insert(key.clone(), job.id.clone());
                }
                self.jobs.insert(job.id.clone(), job.clone());
            }
            RegistryOp::AppendJobEvent(event) => {
                self.job_event_seq = self.job_event_seq.max(event.seq);
                self.job_events.push(event.clone());
            }
            RegistryOp::PutEmbeddingCache(entry) => {
                self.embedding_cache.insert(entry.key.clone(), entry.clone());
            }
            RegistryOp::PutRerankCache(entry) => {
                self.rerank_cache.insert(entry.key.clone(), entry.clone());
            }
            RegistryOp::SweepCaches { now_ms } => {
                self.embedding_cache
                    .retain(|_, e| !cache_expired(e.created_at_ms, e.ttl_s, *now_ms));
                self.rerank_cache
                    .retain(|_, e| !cache_expired(e.created_at_ms, e.ttl_s, *now_ms));
            }
            RegistryOp::PutLink(link) => {
                if !self.links.contains(link) {
                    self.links.push(link.clone());
                }
            }
            RegistryOp::PutSubscription(sub) => {
                let exists = self
                    .subscriptions
                    .iter()
                    .any(|s| s.container_id == sub.container_id && s.agent_id == sub.agent_id);
                if !exists {
                    self.subscriptions.push(sub.clone());
                }
            }
            RegistryOp::PutAgentSession(session) => {
                self.agent_sessions
                    .insert(session.agent_id.clone(), session.clone());
            }
        }
    }

    fn insert_chunk(&mut self, chunk: Chunk) {
        // Re-put: clear stale secondary index entries first.
        if let Some(existing) = self.chunks.get(&chunk.id).cloned() {
            self.unindex_chunk(&existing);
        }

        if !chunk.text.is_empty() {
            if let Some(index) = self.text_indexes.get_mut(&chunk.container_id) {
                index.insert(chunk.id.clone(), &chunk.text);
            }
            if chunk.is_canonical() {
                self.text_hash_index.insert(
                    (chunk.container_id.clone(), sha256_hex(chunk.text.as_bytes())),
                    chunk.id.clone(),
                );
            }
        }
        if let Some(canonical) = &chunk.dedup_of {
            self.dedup_dependents
                .entry(canonical.clone())
                .or_default()
                .push(chunk.id.clone());
        }
        let by_doc = self.chunks_by_doc.entry(chunk.document_id.clone()).or_default();
        if !by_doc.contains(&chunk.id) {
            by_doc.push(chunk.id.clone());
        }
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    fn unindex_chunk(&mut self, chunk: &Chunk) {
        if let Some(index) = self.text_indexes.get_mut(&chunk.container_id) {
            index.remove(&chunk.id);
        }
        if !chunk.text.is_empty() && chunk.is_canonical() {
            let key = (chunk.container_id.clone(), sha256_hex(chunk.text.as_bytes()));
            if self.text_hash_index.get(&key) == Some(&chunk.id) {
                self.text_hash_index.remove(&key);
            }
        }
        if let Some(canonical) = &chunk.dedup_of {
            if let Some(dependents) = self.dedup_dependents.get_mut(canonical) {
                dependents.retain(|id| id != &chunk.id);
            }
        }
    }

    fn remove_document(&mut self, document_id: &str) {
        let Some(document) = self.documents.remove(document_id) else {
            return;
        };
        self.doc_by_hash
            .remove(&(document.container_id.clone(), document.content_hash.clone()));

        if let Some(chunk_ids) = self.chunks_by_doc.remove(document_id) {
            for chunk_id in chunk_ids {
                if let Some(chunk) = self.chunks.remove(&chunk_id) {
                    self.unindex_chunk(&chunk);
                    self.dedup_dependents.remove(&chunk.id);
                }
            }
        }
    }
}

fn add_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

fn cache_expired(created_at_ms: i64, ttl_s: u64, now_ms: i64) -> bool {
    now_ms - created_at_ms >= (ttl_s as i64) * 1000
}

/// The system of record. Every cross-store write starts here; the vector and
/// blob stores are updated idempotently afterwards, so a crash between writes
/// heals on retry.
pub struct Registry {
    journal: Arc<Mutex<Journal>>,
    tx_lock: Arc<Mutex<()>>,
    state: Arc<RwLock<MaterializedState>>,
    backups: Option<BackupStore>,
}

/// Backups retained alongside the journal; recovery needs only the newest
/// valid one.
const BACKUP_KEEP: usize = 3;

impl Registry {
    pub async fn open(journal_path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::open_internal(journal_path.as_ref().to_path_buf(), None).await
    }

    /// Open with backup-assisted recovery: newest valid backup first, then
    /// the journal delta past its sequence.
    pub async fn open_with_backups(
        journal_path: impl AsRef<Path>,
        backup_dir: impl AsRef<Path>,
    ) -> Result<Self, RegistryError> {
        let backups = BackupStore::new(backup_dir.as_ref(), BACKUP_KEEP);
        Self::open_internal(journal_path.as_ref().to_path_buf(), Some(backups)).await
    }

    async fn open_internal(
        journal_path: PathBuf,
        backups: Option<BackupStore>,
    ) -> Result<Self, RegistryError> {
        let (mut materialized, base_seq) = load_state_from_backup(backups.as_ref()).await?;

        let (journal, frames) = Journal::open(&journal_path).await?;
        for (seq, data) in frames {
            if seq <= base_seq {
                continue;
            }
            let archived = rkyv::check_archived_root::<TxRecord>(&data[..])
                .map_err(|_| RegistryError::Deserialization)?;
            let record: TxRecord = archived
                .deserialize(&mut rkyv::Infallible)
                .map_err(|_| RegistryError::Deserialization)?;
            let TxRecord::Transaction(ops) = record;
            for op in &ops {
                materialized.apply(op);
            }
        }

        Ok(Self {
            journal: Arc::new(Mutex::new(journal)),
            tx_lock: Arc::new(Mutex::new(())),
            state: Arc::new(RwLock::new(materialized)),
            backups,
        })
    }

    /// Apply mutations atomically within one transaction boundary. On
    /// validation failure nothing reaches the journal or the in-memory
    /// state.
    pub async fn apply(&self, ops: Vec<RegistryOp>) -> Result<(), RegistryError> {
        if ops.is_empty() {
            return Ok(());
        }

        let _tx_guard = self.tx_lock.lock().await;
        self.validate(&ops).await?;
        self.commit(ops).await
    }

    /// Commit without re-validating; callers hold the tx lock and have
    /// validated against current state.
    async fn commit(&self, ops: Vec<RegistryOp>) -> Result<(), RegistryError> {
        let record = TxRecord::Transaction(ops.clone());
        let bytes = serialize_record(&record)?;

        {
            let mut journal = self.journal.lock().await;
            journal.append(&bytes).await?;
            journal.commit().await?;
        }

        let mut state = self.state.write().await;
        for op in &ops {
            state.apply(op);
        }
        Ok(())
    }

    async fn validate(&self, ops: &[RegistryOp]) -> Result<(), RegistryError> {
        let state = self.state.read().await;
        let mut new_containers: Vec<&str> = Vec::new();
        let mut new_documents: Vec<&str> = Vec::new();
        let mut new_chunks: HashMap<&str, &Chunk> = HashMap::new();

        for op in ops {
            match op {
                RegistryOp::PutContainer(container) => {
                    if let Some(existing_id) = state.slug_index.get(&container.manifest.slug) {
                        if existing_id != &container.id {
                            return Err(RegistryError::Conflict(format!(
                                "slug {} already in use",
                                container.manifest.slug
                            )));
                        }
                    }
                    new_containers.push(&container.id);
                }
                RegistryOp::PutDocument(document) => {
                    let known = state.containers.contains_key(&document.container_id)
                        || new_containers.contains(&document.container_id.as_str());
                    if !known {
                        return Err(RegistryError::InvalidTransaction(format!(
                            "document {} references missing container {}",
                            document.id, document.container_id
                        )));
                    }
                    new_documents.push(&document.id);
                }
                RegistryOp::PutChunk(chunk) => {
                    let doc_known = state.documents.contains_key(&chunk.document_id)
                        || new_documents.contains(&chunk.document_id.as_str());
                    if !doc_known {
                        return Err(RegistryError::InvalidTransaction(format!(
                            "chunk {} references missing document {}",
                            chunk.id, chunk.document_id
                        )));
                    }
                    if let Some(canonical_id) = &chunk.dedup_of {
                        let canonical = state
                            .chunks
                            .get(canonical_id)
                            .or_else(|| new_chunks.get(canonical_id.as_str()).copied());
                        match canonical {
                            None => {
                                return Err(RegistryError::InvalidTransaction(format!(
                                    "chunk {} dedups onto missing chunk {}",
                                    chunk.id, canonical_id
                                )))
                            }
                            Some(canonical) => {
                                if canonical.container_id != chunk.container_id {
                                    return Err(RegistryError::InvalidTransaction(
                                        "dedup_of must stay within one container".to_string(),
                                    ));
                                }
                                if !canonical.is_canonical() {
                                    return Err(RegistryError::InvalidTransaction(
                                        "dedup_of must not chain".to_string(),
                                    ));
                                }
                            }
                        }
                    }
                    new_chunks.insert(&chunk.id, chunk);
                }
                RegistryOp::BumpStats { container_id, .. } => {
                    let known = state.containers.contains_key(container_id)
                        || new_containers.contains(&container_id.as_str());
                    if !known {
                        return Err(RegistryError::InvalidTransaction(format!(
                            "stats update for missing container {}",
                            container_id
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    pub async fn get_container(&self, id: &str) -> Option<Container> {
        self.state.read().await.containers.get(id).cloned()
    }

    /// Accepts an id or a slug; lifecycle and retrieval both address
    /// containers either way.
    pub async fn find_container(&self, id_or_slug: &str) -> Option<Container> {
        let state = self.state.read().await;
        if let Some(container) = state.containers.get(id_or_slug) {
            return Some(container.clone());
        }
        state
            .slug_index
            .get(id_or_slug)
            .and_then(|id| state.containers.get(id))
            .cloned()
    }

    pub async fn list_containers(&self, filter: &ContainerFilter) -> Vec<Container> {
        let state = self.state.read().await;
        let mut out: Vec<Container> = state
            .containers
            .values()
            .filter(|c| filter.state.map_or(true, |s| c.state == s))
            .filter(|c| {
                filter.search.as_deref().map_or(true, |needle| {
                    let needle = needle.to_lowercase();
                    c.manifest.slug.to_lowercase().contains(&needle)
                        || c.manifest.theme.to_lowercase().contains(&needle)
                        || c.manifest.description.to_lowercase().contains(&needle)
                })
            })
            .filter(|c| {
                filter.parent.as_deref().map_or(true, |parent| {
                    state
                        .links
                        .iter()
                        .any(|l| l.parent_id == parent && l.child_id == c.id)
                })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.manifest.slug.cmp(&b.manifest.slug));
        out
    }

    // ------------------------------------------------------------------
    // Documents and chunks
    // ------------------------------------------------------------------

    pub async fn get_document(&self, id: &str) -> Option<Document> {
        self.state.read().await.documents.get(id).cloned()
    }

    pub async fn find_document_by_hash(
        &self,
        container_id: &str,
        content_hash: &str,
    ) -> Option<Document> {
        let state = self.state.read().await;
        state
            .doc_by_hash
            .get(&(container_id.to_string(), content_hash.to_string()))
            .and_then(|id| state.documents.get(id))
            .cloned()
    }

    pub async fn list_documents(&self, container_id: &str) -> Vec<Document> {
        let state = self.state.read().await;
        let mut out: Vec<Document> = state
            .documents
            .values()
            .filter(|d| d.container_id == container_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get_chunk(&self, id: &str) -> Option<Chunk> {
        self.state.read().await.chunks.get(id).cloned()
    }

    pub async fn get_chunks(&self, ids: &[String]) -> Vec<Chunk> {
        let state = self.state.read().await;
        ids.iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect()
    }

    pub async fn chunks_by_document(&self, document_id: &str) -> Vec<Chunk> {
        let state = self.state.read().await;
        let mut out: Vec<Chunk> = state
            .chunks_by_doc
            .get(document_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.chunks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|c| c.ordinal);
        out
    }

    pub async fn chunks_by_container(&self, container_id: &str) -> Vec<Chunk> {
        let state = self.state.read().await;
        let mut out: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.container_id == container_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Exact-dedup lookup: the canonical chunk in this container with
    /// identical text, if any.
    pub async fn find_canonical_by_text_hash(
        &self,
        container_id: &str,
        text_hash: &str,
    ) -> Option<Chunk> {
        let state = self.state.read().await;
        state
            .text_hash_index
            .get(&(container_id.to_string(), text_hash.to_string()))
            .and_then(|id| state.chunks.get(id))
            .cloned()
    }

    /// BM25 over the container's full-text partition, filtered by the
    /// modality whitelist.
    pub async fn bm25_search(
        &self,
        container_id: &str,
        query: &str,
        k: usize,
        modalities: &[Modality],
    ) -> Vec<(String, f32)> {
        let state = self.state.read().await;
        let Some(index) = state.text_indexes.get(container_id) else {
            return Vec::new();
        };

        index
            .search(query, k.saturating_mul(2))
            .into_iter()
            .filter(|(id, _)| {
                state
                    .chunks
                    .get(id)
                    .map(|chunk| modalities.contains(&chunk.modality))
                    .unwrap_or(false)
            })
            .take(k)
            .collect()
    }

    /// Remove a document, promoting deduped peers so no chunk is left
    /// pointing at a deleted canonical.
    pub async fn delete_document(
        &self,
        document_id: &str,
    ) -> Result<DocumentDeletion, RegistryError> {
        let _tx_guard = self.tx_lock.lock().await;

        let (document, removed_chunks, repointed, promotions) = {
            let state = self.state.read().await;
            let document = state
                .documents
                .get(document_id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(document_id.to_string()))?;

            let removed: Vec<Chunk> = state
                .chunks_by_doc
                .get(document_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| state.chunks.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default();

            let mut repointed: Vec<Chunk> = Vec::new();
            let mut promotions: Vec<(String, String)> = Vec::new();

            for chunk in removed.iter().filter(|c| c.is_canonical()) {
                let mut dependents: Vec<Chunk> = state
                    .dedup_dependents
                    .get(&chunk.id)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| state.chunks.get(id).cloned())
                            .filter(|c| c.document_id != document_id)
                            .collect()
                    })
                    .unwrap_or_default();
                if dependents.is_empty() {
                    continue;
                }
                dependents.sort_by(|a, b| a.id.cmp(&b.id));

                let mut promoted = dependents.remove(0);
                promoted.dedup_of = None;
                promotions.push((chunk.id.clone(), promoted.id.clone()));
                let promoted_id = promoted.id.clone();
                repointed.push(promoted);
                for mut dependent in dependents {
                    dependent.dedup_of = Some(promoted_id.clone());
                    repointed.push(dependent);
                }
            }

            (document, removed, repointed, promotions)
        };

        let mut ops: Vec<RegistryOp> =
            repointed.into_iter().map(RegistryOp::PutChunk).collect();
        ops.push(RegistryOp::DeleteDocument {
            document_id: document_id.to_string(),
        });
        ops.push(RegistryOp::BumpStats {
            container_id: document.container_id.clone(),
            docs_delta: -1,
            chunks_delta: -(removed_chunks.len() as i64),
            bytes_delta: 0,
            last_ingest_ms: None,
        });
        self.commit(ops).await?;

        Ok(DocumentDeletion {
            document,
            removed_chunks,
            promotions,
        })
    }

    // ------------------------------------------------------------------
    // Jobs: store-level primitives with skip-locked claim semantics. The
    // jobs crate layers backoff and dead-letter policy on top.
    // ------------------------------------------------------------------

    /// Insert a job unless its idempotency key already names a non-terminal
    /// one; returns the surviving job either way.
    pub async fn enqueue_job(&self, job: Job) -> Result<Job, RegistryError> {
        let _tx_guard = self.tx_lock.lock().await;

        {
            let state = self.state.read().await;
            if let Some(key) = &job.idempotency_key {
                if let Some(existing) = state
                    .jobs_by_idem
                    .get(key)
                    .and_then(|id| state.jobs.get(id))
                {
                    if !existing.state.is_terminal() {
                        return Ok(existing.clone());
                    }
                }
            }
        }

        self.commit(vec![RegistryOp::PutJob(job.clone())]).await?;
        Ok(job)
    }

    /// Atomically select one claimable job: FIFO by created_at with a
    /// per-worker hashed tie-break so concurrent claimers spread over
    /// equal-age duplicates. An expired lease counts as claimable.
    pub async fn claim_next_job(
        &self,
        kinds: &[JobKind],
        worker_id: &str,
        lease_ms: u64,
        now_ms: i64,
    ) -> Result<Option<Job>, RegistryError> {
        let _tx_guard = self.tx_lock.lock().await;

        let selected = {
            let state = self.state.read().await;
            let mut candidates: Vec<&Job> = state
                .jobs
                .values()
                .filter(|job| kinds.contains(&job.kind))
                .filter(|job| match job.state {
                    JobState::Queued => job.not_before_ms.map_or(true, |nb| nb <= now_ms),
                    JobState::Running => job
                        .lease_expires_at_ms
                        .map_or(false, |expires| expires <= now_ms),
                    _ => false,
                })
                .collect();

            candidates.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| claim_tie_break(&a.id, worker_id).cmp(&claim_tie_break(&b.id, worker_id)))
                    .then_with(|| a.id.cmp(&b.id))
            });
            candidates.first().map(|job| (*job).clone())
        };

        let Some(mut job) = selected else {
            return Ok(None);
        };

        let mut ops = Vec::new();
        let mut seq = self.next_event_seq().await;

        if job.state == JobState::Running {
            // Expired lease: fold the implicit reap into the claim.
            ops.push(RegistryOp::AppendJobEvent(JobEvent {
                job_id: job.id.clone(),
                seq,
                prev_state: JobState::Running,
                new_state: JobState::Queued,
                reason: "lease_expired".to_string(),
                worker_id: job.worker_id.clone(),
                at_ms: now_ms,
            }));
            seq += 1;
        }

        job.state = JobState::Running;
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at_ms = Some(now_ms + lease_ms as i64);
        job.not_before_ms = None;
        job.updated_at_ms = now_ms;

        ops.push(RegistryOp::PutJob(job.clone()));
        ops.push(RegistryOp::AppendJobEvent(JobEvent {
            job_id: job.id.clone(),
            seq,
            prev_state: JobState::Queued,
            new_state: JobState::Running,
            reason: "claim".to_string(),
            worker_id: Some(worker_id.to_string()),
            at_ms: now_ms,
        }));

        self.commit(ops).await?;
        Ok(Some(job))
    }

    /// Extend the lease. Fails with Conflict when the caller no longer holds
    /// the job.
    pub async fn heartbeat_job(
        &self,
        job_id: &str,
        worker_id: &str,
        lease_ms: u64,
        now_ms: i64,
    ) -> Result<Job, RegistryError> {
        let _tx_guard = self.tx_lock.lock().await;

        let mut job = {
            let state = self.state.read().await;
            state
                .jobs
                .get(job_id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?
        };

        if job.state != JobState::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Err(RegistryError::Conflict("lease lost".to_string()));
        }

        job.lease_expires_at_ms = Some(now_ms + lease_ms as i64);
        job.updated_at_ms = now_ms;
        self.commit(vec![RegistryOp::PutJob(job.clone())]).await?;
        Ok(job)
    }

    pub async fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        result_json: String,
        now_ms: i64,
    ) -> Result<Job, RegistryError> {
        self.finish_job(job_id, worker_id, JobState::Done, None, Some(result_json), None, now_ms)
            .await
    }

    /// Terminal failure or backoff re-queue, depending on `requeue_at_ms`.
    pub async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        error: String,
        requeue_at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<Job, RegistryError> {
        match requeue_at_ms {
            Some(at) => {
                self.finish_job(
                    job_id,
                    worker_id,
                    JobState::Queued,
                    Some(error),
                    None,
                    Some(at),
                    now_ms,
                )
                .await
            }
            None => {
                self.finish_job(job_id, worker_id, JobState::Failed, Some(error), None, None, now_ms)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_job(
        &self,
        job_id: &str,
        worker_id: &str,
        new_state: JobState,
        error: Option<String>,
        result_json: Option<String>,
        not_before_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<Job, RegistryError> {
        let _tx_guard = self.tx_lock.lock().await;

        let mut job = {
            let state = self.state.read().await;
            state
                .jobs
                .get(job_id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))?
        };

        if job.state != JobState::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Err(RegistryError::Conflict("lease lost".to_string()));
        }

        let prev_state = job.state;
        job.state = new_state;
        job.worker_id = None;
        job.lease_expires_at_ms = None;
        job.not_before_ms = not_before_ms;
        job.last_error = error.clone().or(job.last_error);
        if result_json.is_some() {
            job.result_json = result_json;
        }
        job.updated_at_ms = now_ms;

        let seq = self.next_event_seq().await;
        let reason = match (new_state, &error) {
            (JobState::Done, _) => "complete".to_string(),
            (JobState::Queued, Some(err)) => format!("retry: {}", err),
            (JobState::Failed, Some(err)) => format!("failed: {}", err),
            _ => new_state.as_str().to_string(),
        };

        self.commit(vec![
            RegistryOp::PutJob(job.clone()),
            RegistryOp::AppendJobEvent(JobEvent {
                job_id: job.id.clone(),
                seq,
                prev_state,
                new_state,
                reason,
                worker_id: Some(worker_id.to_string()),
                at_ms: now_ms,
            }),
        ])
        .await?;
        Ok(job)
    }

    /// Background sweep: re-queue running jobs whose lease expired without a
    /// heartbeat. Attempts are left unchanged.
    pub async fn reap_expired_jobs(&self, now_ms: i64) -> Result<Vec<Job>, RegistryError> {
        let _tx_guard = self.tx_lock.lock().await;

        let expired: Vec<Job> = {
            let state = self.state.read().await;
            state
                .jobs
                .values()
                .filter(|job| {
                    job.state == JobState::Running
                        && job
                            .lease_expires_at_ms
                            .map_or(false, |expires| expires <= now_ms)
                })
                .cloned()
                .collect()
        };

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut ops = Vec::new();
        let mut reaped = Vec::new();
        let mut seq = self.next_event_seq().await;
        for mut job in expired {
            let holder = job.worker_id.take();
            warn!(job_id = %job.id, "reaping job with expired lease");
            job.state = JobState::Queued;
            job.lease_expires_at_ms = None;
            job.updated_at_ms = now_ms;
            ops.push(RegistryOp::PutJob(job.clone()));
            ops.push(RegistryOp::AppendJobEvent(JobEvent {
                job_id: job.id.clone(),
                seq,
                prev_state: JobState::Running,
                new_state: JobState::Queued,
                reason: "reap".to_string(),
                worker_id: holder,
                at_ms: now_ms,
            }));
            seq += 1;
            reaped.push(job);
        }

        self.commit(ops).await?;
        Ok(reaped)
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(id).cloned()
    }

    pub async fn get_jobs(&self, ids: &[String]) -> Vec<Job> {
        let state = self.state.read().await;
        ids.iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub async fn count_jobs_by_state(&self, state_filter: JobState) -> usize {
        let state = self.state.read().await;
        state
            .jobs
            .values()
            .filter(|job| job.state == state_filter)
            .count()
    }

    pub async fn job_events(&self, job_id: &str) -> Vec<JobEvent> {
        let state = self.state.read().await;
        let mut out: Vec<JobEvent> = state
            .job_events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.seq);
        out
    }

    async fn next_event_seq(&self) -> u64 {
        self.state.read().await.job_event_seq + 1
    }

    // ------------------------------------------------------------------
    // Caches, links, subscriptions, agent sessions
    // ------------------------------------------------------------------

    pub async fn embedding_cache_get(&self, key: &str, now_ms: i64) -> Option<Vec<f32>> {
        let state = self.state.read().await;
        state.embedding_cache.get(key).and_then(|entry| {
            (!cache_expired(entry.created_at_ms, entry.ttl_s, now_ms)).then(|| entry.vector.clone())
        })
    }

    pub async fn embedding_cache_put(
        &self,
        key: String,
        vector: Vec<f32>,
        ttl_s: u64,
        now_ms: i64,
    ) -> Result<(), RegistryError> {
        self.apply(vec![RegistryOp::PutEmbeddingCache(EmbeddingCacheEntry {
            key,
            vector,
            created_at_ms: now_ms,
            ttl_s,
        })])
        .await
    }

    pub async fn rerank_cache_get(&self, key: &str, now_ms: i64) -> Option<Vec<f32>> {
        let state = self.state.read().await;
        state.rerank_cache.get(key).and_then(|entry| {
            (!cache_expired(entry.created_at_ms, entry.ttl_s, now_ms)).then(|| entry.scores.clone())
        })
    }

    pub async fn rerank_cache_put(
        &self,
        key: String,
        scores: Vec<f32>,
        ttl_s: u64,
        now_ms: i64,
    ) -> Result<(), RegistryError> {
        self.apply(vec![RegistryOp::PutRerankCache(RerankCacheEntry {
            key,
            scores,
            created_at_ms: now_ms,
            ttl_s,
        })])
        .await
    }

    pub async fn sweep_caches(&self, now_ms: i64) -> Result<(), RegistryError> {
        self.apply(vec![RegistryOp::SweepCaches { now_ms }]).await
    }

    pub async fn put_link(&self, parent_id: String, child_id: String) -> Result<(), RegistryError> {
        self.apply(vec![RegistryOp::PutLink(ContainerLink {
            parent_id,
            child_id,
        })])
        .await
    }

    pub async fn put_subscription(
        &self,
        container_id: String,
        agent_id: String,
        now_ms: i64,
    ) -> Result<(), RegistryError> {
        self.apply(vec![RegistryOp::PutSubscription(ContainerSubscription {
            container_id,
            agent_id,
            created_at_ms: now_ms,
        })])
        .await
    }

    pub async fn touch_agent_session(
        &self,
        agent_id: String,
        agent_name: Option<String>,
        now_ms: i64,
    ) -> Result<(), RegistryError> {
        self.apply(vec![RegistryOp::PutAgentSession(AgentSession {
            agent_id,
            agent_name,
            last_seen_ms: now_ms,
        })])
        .await
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    /// Package the full materialized state as a checksummed backup at the
    /// current journal sequence. Retention pruning happens in the store.
    pub async fn create_backup(&self) -> Result<u64, RegistryError> {
        let backups = self
            .backups
            .as_ref()
            .ok_or(RegistryError::BackupNotConfigured)?;

        let backup = {
            let _tx_guard = self.tx_lock.lock().await;
            let lsn = self.journal.lock().await.last_seq();
            let state = self.state.read().await;

            let mut containers: Vec<Container> = state.containers.values().cloned().collect();
            containers.sort_by(|a, b| a.id.cmp(&b.id));
            let mut documents: Vec<Document> = state.documents.values().cloned().collect();
            documents.sort_by(|a, b| a.id.cmp(&b.id));
            let mut chunks: Vec<Chunk> = state.chunks.values().cloned().collect();
            chunks.sort_by(|a, b| a.id.cmp(&b.id));
            let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
            jobs.sort_by(|a, b| a.id.cmp(&b.id));
            let mut embedding_cache: Vec<EmbeddingCacheEntry> =
                state.embedding_cache.values().cloned().collect();
            embedding_cache.sort_by(|a, b| a.key.cmp(&b.key));
            let mut rerank_cache: Vec<RerankCacheEntry> =
                state.rerank_cache.values().cloned().collect();
            rerank_cache.sort_by(|a, b| a.key.cmp(&b.key));
            let mut agent_sessions: Vec<AgentSession> =
                state.agent_sessions.values().cloned().collect();
            agent_sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

            RegistryBackup {
                lsn,
                containers,
                documents,
                chunks,
                jobs,
                job_events: state.job_events.clone(),
                embedding_cache,
                rerank_cache,
                links: state.links.clone(),
                subscriptions: state.subscriptions.clone(),
                agent_sessions,
            }
        };

        let mut serializer = AllocSerializer::<4096>::default();
        serializer
            .serialize_value(&backup)
            .map_err(|_| RegistryError::Serialization)?;
        let bytes = serializer.into_serializer().into_inner();

        backups.store(backup.lsn, &bytes).await?;
        Ok(backup.lsn)
    }
}

fn claim_tie_break(job_id: &str, worker_id: &str) -> String {
    sha256_hex(format!("{}:{}", job_id, worker_id).as_bytes())
}

fn serialize_record(record: &TxRecord) -> Result<Vec<u8>, RegistryError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(record)
        .map_err(|_| RegistryError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

async fn load_state_from_backup(
    backups: Option<&BackupStore>,
) -> Result<(MaterializedState, u64), RegistryError> {
    let Some(backups) = backups else {
        return Ok((MaterializedState::default(), 0));
    };

    let Some((backup_seq, bytes)) = backups.latest().await? else {
        return Ok((MaterializedState::default(), 0));
    };

    let archived = rkyv::check_archived_root::<RegistryBackup>(&bytes[..])
        .map_err(|_| RegistryError::Deserialization)?;
    let backup: RegistryBackup = archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| RegistryError::Deserialization)?;
    if backup.lsn != backup_seq {
        return Err(RegistryError::Deserialization);
    }

    let mut state = MaterializedState::default();
    for container in backup.containers {
        state.apply(&RegistryOp::PutContainer(container));
    }
    for document in backup.documents {
        state.apply(&RegistryOp::PutDocument(document));
    }
    for chunk in backup.chunks {
        state.apply(&RegistryOp::PutChunk(chunk));
    }
    for job in backup.jobs {
        state.apply(&RegistryOp::PutJob(job));
    }
    for event in backup.job_events {
        state.apply(&RegistryOp::AppendJobEvent(event));
    }
    for entry in backup.embedding_cache {
        state.apply(&RegistryOp::PutEmbeddingCache(entry));
    }
    for entry in backup.rerank_cache {
        state.apply(&RegistryOp::PutRerankCache(entry));
    }
    for link in backup.links {
        state.apply(&RegistryOp::PutLink(link));
    }
    for sub in backup.subscriptions {
        state.apply(&RegistryOp::PutSubscription(sub));
    }
    for session in backup.agent_sessions {
        state.apply(&RegistryOp::PutAgentSession(session));
    }

    Ok((state, backup_seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_core::manifest::{
        ChunkingPolicy, CollaborationPolicy, ContainerManifest, EmbedderRef, GraphPolicy,
        RerankPolicy, Visibility,
    };
    use curio_core::model::{derive_chunk_id, derive_document_id, now_ms};
    use tempfile::tempdir;

    fn manifest(slug: &str) -> ContainerManifest {
        ContainerManifest {
            slug: slug.to_string(),
            theme: "test corpus".to_string(),
            description: String::new(),
            modalities: vec![Modality::Text],
            embedder: EmbedderRef {
                id: "local-hash".to_string(),
                version: "1".to_string(),
                dims: 16,
            },
            latency_budget_ms: 500,
            rerank: RerankPolicy::default(),
            freshness_lambda: 0.0,
            graph: GraphPolicy::default(),
            visibility: Visibility::Public,
            acl: Vec::new(),
            collaboration: CollaborationPolicy::SharedRead,
            semantic_dedup_threshold: 0.92,
            snippet_max_chars: 200,
            chunking: ChunkingPolicy::default(),
            thumbnail_max_edge: 2048,
        }
    }

    fn container(id: &str, slug: &str) -> Container {
        let now = now_ms();
        Container {
            id: id.to_string(),
            manifest: manifest(slug),
            state: ContainerState::Active,
            stats: Default::default(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    fn document(container_id: &str, hash: &str) -> Document {
        Document {
            id: derive_document_id(container_id, hash),
            container_id: container_id.to_string(),
            uri: "inline://test".to_string(),
            mime: "text/plain".to_string(),
            content_hash: hash.to_string(),
            title: "test".to_string(),
            modality: Modality::Text,
            ingested_at_ms: now_ms(),
            fetcher: "inline".to_string(),
            original_path: None,
            chunk_count: 1,
            state: DocumentState::Active,
        }
    }

    fn chunk(doc: &Document, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            id: derive_chunk_id(&doc.id, ordinal),
            document_id: doc.id.clone(),
            container_id: doc.container_id.clone(),
            modality: Modality::Text,
            ordinal,
            text: text.to_string(),
            char_start: 0,
            char_end: text.len() as u64,
            page: None,
            dedup_of: None,
            embedder_id: "local-hash".to_string(),
            embedder_version: "1".to_string(),
            created_at_ms: now_ms(),
        }
    }

    fn job(id: &str, kind: JobKind, created_at_ms: i64) -> Job {
        Job {
            id: id.to_string(),
            kind,
            container_id: "ct_1".to_string(),
            payload_json: "{}".to_string(),
            state: JobState::Queued,
            attempts: 0,
            max_attempts: 5,
            lease_expires_at_ms: None,
            worker_id: None,
            not_before_ms: None,
            last_error: None,
            result_json: None,
            idempotency_key: None,
            agent_id: None,
            created_at_ms,
            updated_at_ms: created_at_ms,
        }
    }

    async fn open_registry(dir: &tempfile::TempDir) -> Registry {
        Registry::open(dir.path().join("registry.journal")).await.unwrap()
    }

    #[tokio::test]
    async fn container_roundtrip_and_slug_lookup() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();

        assert!(registry.get_container("ct_1").await.is_some());
        assert_eq!(
            registry.find_container("art").await.unwrap().id,
            "ct_1"
        );
    }

    #[tokio::test]
    async fn slug_conflict_is_rejected() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();
        let err = registry
            .apply(vec![RegistryOp::PutContainer(container("ct_2", "art"))])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test]
    async fn state_survives_replay() {
        let dir = tempdir().unwrap();
        let journal_path = dir.path().join("registry.journal");

        {
            let registry = Registry::open(&journal_path).await.unwrap();
            let c = container("ct_1", "art");
            let d = document("ct_1", "hash-a");
            let ch = chunk(&d, 0, "Kandinsky on color.");
            registry
                .apply(vec![
                    RegistryOp::PutContainer(c),
                    RegistryOp::PutDocument(d),
                    RegistryOp::PutChunk(ch),
                ])
                .await
                .unwrap();
        }

        {
            let registry = Registry::open(&journal_path).await.unwrap();
            assert!(registry.get_container("ct_1").await.is_some());
            let hits = registry
                .bm25_search("ct_1", "Kandinsky", 5, &[Modality::Text])
                .await;
            assert_eq!(hits.len(), 1);
        }
    }

    #[tokio::test]
    async fn chunk_referencing_missing_document_is_rejected() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();
        let d = document("ct_1", "hash-a");
        let orphan = chunk(&d, 0, "text");

        let err = registry
            .apply(vec![RegistryOp::PutChunk(orphan)])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn dedup_chains_are_rejected() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        let c = container("ct_1", "art");
        let d = document("ct_1", "hash-a");
        let canonical = chunk(&d, 0, "original");
        let mut first_dup = chunk(&d, 1, "dup one");
        first_dup.dedup_of = Some(canonical.id.clone());
        let mut chained = chunk(&d, 2, "dup two");
        chained.dedup_of = Some(first_dup.id.clone());

        registry
            .apply(vec![
                RegistryOp::PutContainer(c),
                RegistryOp::PutDocument(d),
                RegistryOp::PutChunk(canonical),
                RegistryOp::PutChunk(first_dup),
            ])
            .await
            .unwrap();

        let err = registry
            .apply(vec![RegistryOp::PutChunk(chained)])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransaction(_)));
    }

    #[tokio::test]
    async fn delete_document_promotes_dependent_chunks() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        let c = container("ct_1", "art");
        let d1 = document("ct_1", "hash-a");
        let d2 = document("ct_1", "hash-b");
        let canonical = chunk(&d1, 0, "Expressionism uses color for emotion.");
        let mut dup = chunk(&d2, 0, "Expressionism uses colour for emotion.");
        dup.dedup_of = Some(canonical.id.clone());

        registry
            .apply(vec![
                RegistryOp::PutContainer(c),
                RegistryOp::PutDocument(d1.clone()),
                RegistryOp::PutDocument(d2),
                RegistryOp::PutChunk(canonical.clone()),
                RegistryOp::PutChunk(dup.clone()),
            ])
            .await
            .unwrap();

        let deletion = registry.delete_document(&d1.id).await.unwrap();
        assert_eq!(deletion.removed_chunks.len(), 1);
        assert_eq!(
            deletion.promotions,
            vec![(canonical.id.clone(), dup.id.clone())]
        );

        let promoted = registry.get_chunk(&dup.id).await.unwrap();
        assert!(promoted.dedup_of.is_none());
        assert!(registry.get_chunk(&canonical.id).await.is_none());
    }

    #[tokio::test]
    async fn claim_is_fifo_and_sets_lease() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;
        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();

        registry.enqueue_job(job("job_b", JobKind::Ingest, 100)).await.unwrap();
        registry.enqueue_job(job("job_a", JobKind::Ingest, 50)).await.unwrap();

        let claimed = registry
            .claim_next_job(&[JobKind::Ingest], "w1", 30_000, 200)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "job_a");
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.lease_expires_at_ms, Some(30_200));

        // job_a is leased; the next claim must not see it.
        let claimed = registry
            .claim_next_job(&[JobKind::Ingest], "w2", 30_000, 200)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, "job_b");

        assert!(registry
            .claim_next_job(&[JobKind::Ingest], "w3", 30_000, 200)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed_and_old_heartbeat_conflicts() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;
        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();

        registry.enqueue_job(job("job_j", JobKind::Ingest, 10)).await.unwrap();
        let first = registry
            .claim_next_job(&[JobKind::Ingest], "w1", 1_000, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.attempts, 1);

        // Lease expires at 1_100; claim at 2_000 succeeds for another worker.
        let second = registry
            .claim_next_job(&[JobKind::Ingest], "w2", 1_000, 2_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, "job_j");
        assert_eq!(second.attempts, 2);
        assert_eq!(second.worker_id.as_deref(), Some("w2"));

        let err = registry.heartbeat_job("job_j", "w1", 1_000, 2_100).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));

        registry
            .complete_job("job_j", "w2", "{}".to_string(), 2_200)
            .await
            .unwrap();

        let transitions: Vec<(JobState, JobState)> = registry
            .job_events("job_j")
            .await
            .iter()
            .map(|e| (e.prev_state, e.new_state))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (JobState::Queued, JobState::Running),
                (JobState::Running, JobState::Queued),
                (JobState::Queued, JobState::Running),
                (JobState::Running, JobState::Done),
            ]
        );
    }

    #[tokio::test]
    async fn reap_requeues_without_touching_attempts() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;
        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();

        registry.enqueue_job(job("job_r", JobKind::Refresh, 10)).await.unwrap();
        registry
            .claim_next_job(&[JobKind::Refresh], "w1", 1_000, 100)
            .await
            .unwrap()
            .unwrap();

        let reaped = registry.reap_expired_jobs(5_000).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].state, JobState::Queued);
        assert_eq!(reaped[0].attempts, 1);
    }

    #[tokio::test]
    async fn enqueue_with_same_idempotency_key_returns_existing() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;
        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
            .await
            .unwrap();

        let mut first = job("job_1", JobKind::Ingest, 10);
        first.idempotency_key = Some("idem-1".to_string());
        let mut second = job("job_2", JobKind::Ingest, 20);
        second.idempotency_key = Some("idem-1".to_string());

        let a = registry.enqueue_job(first).await.unwrap();
        let b = registry.enqueue_job(second).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn caches_expire_by_ttl() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        registry
            .embedding_cache_put("k1".to_string(), vec![0.5], 10, 0)
            .await
            .unwrap();

        assert!(registry.embedding_cache_get("k1", 5_000).await.is_some());
        assert!(registry.embedding_cache_get("k1", 10_000).await.is_none());

        registry.sweep_caches(10_000).await.unwrap();
        assert!(registry.embedding_cache_get("k1", 0).await.is_none());
    }

    #[tokio::test]
    async fn backup_restores_with_journal_delta() {
        let dir = tempdir().unwrap();
        let journal_path = dir.path().join("registry.journal");
        let backup_dir = dir.path().join("backups");

        {
            let registry = Registry::open_with_backups(&journal_path, &backup_dir)
                .await
                .unwrap();
            registry
                .apply(vec![RegistryOp::PutContainer(container("ct_1", "art"))])
                .await
                .unwrap();
            registry.create_backup().await.unwrap();
            registry
                .apply(vec![RegistryOp::PutContainer(container("ct_2", "science"))])
                .await
                .unwrap();
        }

        let reopened = Registry::open_with_backups(&journal_path, &backup_dir)
            .await
            .unwrap();
        assert!(reopened.get_container("ct_1").await.is_some());
        assert!(reopened.get_container("ct_2").await.is_some());
    }

    #[tokio::test]
    async fn backup_without_store_is_a_typed_error() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;
        let err = registry.create_backup().await.unwrap_err();
        assert!(matches!(err, RegistryError::BackupNotConfigured));
    }

    #[tokio::test]
    async fn list_containers_applies_filters() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir).await;

        let mut archived = container("ct_old", "archive-me");
        archived.state = ContainerState::Archived;
        registry
            .apply(vec![
                RegistryOp::PutContainer(container("ct_1", "modern-art")),
                RegistryOp::PutContainer(archived),
            ])
            .await
            .unwrap();
        registry
            .put_link("ct_1".to_string(), "ct_old".to_string())
            .await
            .unwrap();

        let active = registry
            .list_containers(&ContainerFilter {
                state: Some(ContainerState::Active),
                ..Default::default()
            })
            .await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "ct_1");

        let searched = registry
            .list_containers(&ContainerFilter {
                search: Some("modern".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(searched.len(), 1);

        let children = registry
            .list_containers(&ContainerFilter {
                parent: Some("ct_1".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "ct_old");
    }
}
