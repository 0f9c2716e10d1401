use curio_core::embedding::cosine_similarity;
use curio_core::model::Chunk;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// One ranked hit coming out of a retrieval stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: String,
    pub score: f32,
    pub stage_scores: HashMap<String, f32>,
    max_stage_score: f32,
}

/// Reciprocal Rank Fusion across surviving stages:
/// `score = Σ 1 / (k0 + rank_in_stage)`. Ties break by higher max stage
/// score, then by chunk id ascending, so ordering is stable for identical
/// inputs.
pub fn rrf_fuse(stages: &[(&str, Vec<StageHit>)], k0: f32) -> Vec<FusedHit> {
    let mut fused: HashMap<String, FusedHit> = HashMap::new();

    for (stage_name, hits) in stages {
        for (rank, hit) in hits.iter().enumerate() {
            let contribution = 1.0 / (k0 + rank as f32 + 1.0);
            let entry = fused
                .entry(hit.chunk_id.clone())
                .or_insert_with(|| FusedHit {
                    chunk_id: hit.chunk_id.clone(),
                    score: 0.0,
                    stage_scores: HashMap::new(),
                    max_stage_score: f32::MIN,
                });
            entry.score += contribution;
            entry.stage_scores.insert(stage_name.to_string(), hit.score);
            entry.max_stage_score = entry.max_stage_score.max(hit.score);
        }
    }

    let mut out: Vec<FusedHit> = fused.into_values().collect();
    sort_hits(&mut out);
    out
}

pub fn sort_hits(hits: &mut [FusedHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.max_stage_score
                    .partial_cmp(&a.max_stage_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Freshness multiplier `exp(-lambda * age_days)`. Items without a timestamp
/// are neutral (factor 1).
pub fn freshness_factor(lambda: f32, age_days: Option<f32>) -> f32 {
    match age_days {
        Some(age) if lambda > 0.0 => (-lambda * age.max(0.0)).exp(),
        _ => 1.0,
    }
}

/// Candidate carried into result dedup: the fused hit, its chunk record, and
/// its vector when the vector store still holds one.
pub struct DedupCandidate {
    pub hit: FusedHit,
    pub chunk: Chunk,
    pub vector: Option<Vec<f32>>,
}

/// Near-duplicate suppression over the ranked list. A candidate is elided
/// when it shares a canonical chunk with an already-kept item (`dedup_of`
/// linkage) or its vector lands within the semantic threshold of one.
/// Returns kept candidates in order plus the elided chunk ids.
pub fn dedup_results(
    ordered: Vec<DedupCandidate>,
    threshold: f32,
) -> (Vec<DedupCandidate>, Vec<String>) {
    let mut kept: Vec<DedupCandidate> = Vec::new();
    let mut seen_canonical: HashSet<String> = HashSet::new();
    let mut elided: Vec<String> = Vec::new();

    for candidate in ordered {
        let canonical = candidate
            .chunk
            .dedup_of
            .clone()
            .unwrap_or_else(|| candidate.chunk.id.clone());

        if seen_canonical.contains(&canonical) {
            elided.push(candidate.chunk.id.clone());
            continue;
        }

        let near_kept = candidate.vector.as_ref().is_some_and(|vector| {
            kept.iter().any(|other| {
                other
                    .vector
                    .as_ref()
                    .and_then(|kept_vec| cosine_similarity(vector, kept_vec))
                    .is_some_and(|score| score >= threshold)
            })
        });
        if near_kept {
            elided.push(candidate.chunk.id.clone());
            continue;
        }

        seen_canonical.insert(canonical);
        kept.push(candidate);
    }

    (kept, elided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_core::model::Modality;

    fn hit(id: &str, score: f32) -> StageHit {
        StageHit {
            chunk_id: id.to_string(),
            score,
        }
    }

    fn chunk(id: &str, dedup_of: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc_1".to_string(),
            container_id: "ct_1".to_string(),
            modality: Modality::Text,
            ordinal: 0,
            text: format!("text of {}", id),
            char_start: 0,
            char_end: 10,
            page: None,
            dedup_of: dedup_of.map(|s| s.to_string()),
            embedder_id: "token-hash".to_string(),
            embedder_version: "1".to_string(),
            created_at_ms: 0,
        }
    }

    #[test]
    fn items_in_both_stages_outrank_single_stage_items() {
        let fused = rrf_fuse(
            &[
                ("bm25", vec![hit("ch_a", 3.0), hit("ch_b", 2.0)]),
                ("vector", vec![hit("ch_b", 0.9), hit("ch_c", 0.8)]),
            ],
            60.0,
        );

        assert_eq!(fused[0].chunk_id, "ch_b");
        assert_eq!(fused[0].stage_scores.len(), 2);
    }

    #[test]
    fn rrf_ties_break_by_max_stage_score_then_id() {
        // ch_a and ch_b each appear once at rank 1 of their stage: equal RRF.
        let fused = rrf_fuse(
            &[
                ("bm25", vec![hit("ch_b", 5.0)]),
                ("vector", vec![hit("ch_a", 0.4)]),
            ],
            60.0,
        );
        assert_eq!(fused[0].chunk_id, "ch_b"); // higher max stage score

        let fused = rrf_fuse(
            &[
                ("bm25", vec![hit("ch_b", 1.0)]),
                ("vector", vec![hit("ch_a", 1.0)]),
            ],
            60.0,
        );
        assert_eq!(fused[0].chunk_id, "ch_a"); // id ascending
    }

    #[test]
    fn freshness_decays_and_neutral_without_timestamp() {
        assert!((freshness_factor(0.1, Some(0.0)) - 1.0).abs() < 1e-6);
        assert!(freshness_factor(0.1, Some(10.0)) < 1.0);
        assert_eq!(freshness_factor(0.1, None), 1.0);
        assert_eq!(freshness_factor(0.0, Some(100.0)), 1.0);
    }

    #[test]
    fn dedup_elides_linked_duplicates_keeping_highest_ranked() {
        let candidates = vec![
            DedupCandidate {
                hit: FusedHit {
                    chunk_id: "ch_a".to_string(),
                    score: 0.9,
                    stage_scores: HashMap::new(),
                    max_stage_score: 0.9,
                },
                chunk: chunk("ch_a", None),
                vector: None,
            },
            DedupCandidate {
                hit: FusedHit {
                    chunk_id: "ch_dup".to_string(),
                    score: 0.5,
                    stage_scores: HashMap::new(),
                    max_stage_score: 0.5,
                },
                chunk: chunk("ch_dup", Some("ch_a")),
                vector: None,
            },
        ];

        let (kept, elided) = dedup_results(candidates, 0.92);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].chunk.id, "ch_a");
        assert_eq!(elided, vec!["ch_dup".to_string()]);
    }

    #[test]
    fn dedup_elides_cosine_near_duplicates() {
        let mk = |id: &str, score: f32, vector: Vec<f32>| DedupCandidate {
            hit: FusedHit {
                chunk_id: id.to_string(),
                score,
                stage_scores: HashMap::new(),
                max_stage_score: score,
            },
            chunk: chunk(id, None),
            vector: Some(vector),
        };

        let (kept, elided) = dedup_results(
            vec![
                mk("ch_a", 0.9, vec![1.0, 0.0]),
                mk("ch_b", 0.8, vec![0.999, 0.01]),
                mk("ch_c", 0.7, vec![0.0, 1.0]),
            ],
            0.95,
        );

        assert_eq!(kept.len(), 2);
        assert_eq!(elided, vec!["ch_b".to_string()]);
    }
}
