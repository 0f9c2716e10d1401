use curio_core::model::{sha256_hex, Chunk};
use std::sync::Arc;
use storage::registry::Registry;
use storage::vector::VectorStore;

/// Per-chunk dedup: exact text-hash reuse first, then cosine proximity
/// against the container's existing canonical vectors. Deduped chunks stay
/// retrievable but share the canonical peer's vector and blob.
pub struct Deduper {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
}

impl Deduper {
    pub fn new(registry: Arc<Registry>, vectors: Arc<VectorStore>) -> Self {
        Self { registry, vectors }
    }

    /// Exact match: another canonical chunk in the container with identical
    /// text.
    pub async fn exact(&self, container_id: &str, text: &str) -> Option<Chunk> {
        if text.is_empty() {
            return None;
        }
        self.registry
            .find_canonical_by_text_hash(container_id, &sha256_hex(text.as_bytes()))
            .await
    }

    /// Semantic match: nearest existing vector in the collection at or above
    /// the container's threshold. Collection rows are canonical-only, so the
    /// returned id never chains.
    pub async fn semantic(
        &self,
        collection: &str,
        vector: &[f32],
        threshold: f32,
    ) -> Option<(String, f32)> {
        let hits = self.vectors.search(collection, vector, 1).await.ok()?;
        let (chunk_id, score) = hits.into_iter().next()?;
        (score >= threshold).then_some((chunk_id, score))
    }
}
