use chrono::{DateTime, TimeZone, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::manifest::ContainerManifest;

/// Millisecond unix timestamp for durable records; rendered as RFC 3339 UTC
/// at the wire boundary.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn stable_id(prefix: &str, parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(prefix.len() + 17);
    hex.push_str(prefix);
    hex.push('_');
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Document ids are stable under re-ingest: the same canonical bytes in the
/// same container always produce the same id.
pub fn derive_document_id(container_id: &str, content_hash: &str) -> String {
    stable_id(
        "doc",
        &[container_id.as_bytes(), content_hash.as_bytes()],
    )
}

pub fn derive_chunk_id(document_id: &str, ordinal: u32) -> String {
    stable_id("ch", &[document_id.as_bytes(), &ordinal.to_le_bytes()])
}

/// Graph entity ids are derived from the normalized name and type so repeated
/// extraction merges instead of duplicating.
pub fn derive_entity_id(container_id: &str, normalized_name: &str, node_type: &str) -> String {
    stable_id(
        "ent",
        &[
            container_id.as_bytes(),
            normalized_name.as_bytes(),
            node_type.as_bytes(),
        ],
    )
}

pub fn derive_container_id(slug: &str, created_at_ms: i64) -> String {
    stable_id("ct", &[slug.as_bytes(), &created_at_ms.to_le_bytes()])
}

pub fn derive_job_id(kind: &str, idempotency_key: &str) -> String {
    stable_id("job", &[kind.as_bytes(), idempotency_key.as_bytes()])
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Pdf,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Pdf => "pdf",
            Modality::Image => "image",
        }
    }
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Active,
    Paused,
    Archived,
}

#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct ContainerStats {
    pub document_count: u64,
    pub chunk_count: u64,
    pub bytes_stored: u64,
    pub last_ingest_ms: Option<i64>,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct Container {
    pub id: String,
    pub manifest: ContainerManifest,
    pub state: ContainerState,
    pub stats: ContainerStats,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Container {
    /// Vector collection names are deterministic from the container id so
    /// upserts after a crash land in the same collection.
    pub fn collection_name(&self, modality: Modality) -> String {
        collection_name(&self.id, modality)
    }
}

pub fn collection_name(container_id: &str, modality: Modality) -> String {
    match modality {
        Modality::Image => format!("c_{}_image", container_id),
        _ => format!("c_{}", container_id),
    }
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Active,
    Deleted,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct Document {
    pub id: String,
    pub container_id: String,
    pub uri: String,
    pub mime: String,
    pub content_hash: String,
    pub title: String,
    pub modality: Modality,
    pub ingested_at_ms: i64,
    pub fetcher: String,
    pub original_path: Option<String>,
    pub chunk_count: u32,
    pub state: DocumentState,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub container_id: String,
    pub modality: Modality,
    pub ordinal: u32,
    /// Empty for image chunks; the blob store holds the artifact.
    pub text: String,
    pub char_start: u64,
    pub char_end: u64,
    pub page: Option<u32>,
    /// When set, points at the canonical chunk in the same container that owns
    /// the vector and blob. Never chains: the target has `dedup_of = None`.
    pub dedup_of: Option<String>,
    pub embedder_id: String,
    pub embedder_version: String,
    pub created_at_ms: i64,
}

impl Chunk {
    pub fn is_canonical(&self) -> bool {
        self.dedup_of.is_none()
    }
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    Refresh,
    Export,
    GraphExtract,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::Refresh => "refresh",
            JobKind::Export => "export",
            JobKind::GraphExtract => "graph_extract",
        }
    }
}

#[derive(
    Archive,
    RkyvDeserialize,
    RkyvSerialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub container_id: String,
    pub payload_json: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_expires_at_ms: Option<i64>,
    pub worker_id: Option<String>,
    /// Earliest time a re-queued job may be claimed again (backoff).
    pub not_before_ms: Option<i64>,
    pub last_error: Option<String>,
    pub result_json: Option<String>,
    pub idempotency_key: Option<String>,
    pub agent_id: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Append-only record of every job state transition.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct JobEvent {
    pub job_id: String,
    pub seq: u64,
    pub prev_state: JobState,
    pub new_state: JobState,
    pub reason: String,
    pub worker_id: Option<String>,
    pub at_ms: i64,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct GraphNode {
    pub id: String,
    pub container_id: String,
    pub label: String,
    pub node_type: String,
    pub summary: String,
    pub source_chunk_id: String,
}

#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub edge_type: String,
    pub container_id: String,
    pub source_chunk_id: String,
}
