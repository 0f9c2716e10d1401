use curio_core::embedding::cosine_similarity;
use std::collections::HashMap;

/// Linear-scan cosine index, one per vector collection. Collections are
/// container-sized, so a scan stays well inside the vector stage budget.
pub struct CosineIndex {
    embeddings: HashMap<String, Vec<f32>>,
}

impl CosineIndex {
    pub fn new() -> Self {
        Self {
            embeddings: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: impl Into<String>, embedding: Vec<f32>) {
        self.embeddings.insert(id.into(), embedding);
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.embeddings.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Vec<f32>> {
        self.embeddings.get(id)
    }

    /// Find top-k nearest neighbors using cosine similarity. Ties break by id
    /// ascending so the ordering is stable for identical inputs.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scores: Vec<(String, f32)> = self
            .embeddings
            .iter()
            .filter_map(|(id, emb)| cosine_similarity(query, emb).map(|score| (id.clone(), score)))
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);
        scores
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.embeddings.keys()
    }
}

impl Default for CosineIndex {
    fn default() -> Self {
        Self::new()
    }
}
