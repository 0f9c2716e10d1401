use crate::fusion::StageHit;
use adapters::translate::{GraphOperation, GraphQuery, GraphSchemaHint, NlTranslator};
use curio_core::error::IssueCode;
use curio_core::manifest::GraphPolicy;
use curio_core::model::{GraphEdge, GraphNode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::graph_store::GraphStore;
use storage::index::text::tokenize;
use tracing::debug;

const EXPANSION_SCORE_FACTOR: f32 = 0.5;

#[derive(Debug, Default)]
pub struct GraphStageOutput {
    /// Chunk-level hits derived from node provenance, ready for fusion.
    pub hits: Vec<StageHit>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub fallback: Option<String>,
    pub issues: Vec<IssueCode>,
    pub execution_ms: u64,
}

/// Whitelist validation of a translated graph query. Rejection is never a
/// user-visible error; the caller falls back to the template path.
pub fn validate_graph_query(
    query: &GraphQuery,
    policy: &GraphPolicy,
    container_id: &str,
) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();

    if query.operation == GraphOperation::Mutation {
        violations.push("only read-only traversal operations are permitted".to_string());
    }
    match &query.container_id {
        Some(id) if id == container_id => {}
        Some(other) => violations.push(format!("query filters foreign container {}", other)),
        None => violations.push("query must filter by container_id".to_string()),
    }
    if !policy.node_labels.is_empty() {
        for label in &query.node_labels {
            if !policy.node_labels.contains(label) {
                violations.push(format!("node label {} not in allowed set", label));
            }
        }
    }
    if !policy.edge_types.is_empty() {
        for edge_type in &query.edge_types {
            if !policy.edge_types.contains(edge_type) {
                violations.push(format!("edge type {} not in allowed set", edge_type));
            }
        }
    }
    if query.max_hops == 0 || query.max_hops > policy.max_hops {
        violations.push(format!(
            "depth {} exceeds max_hops {}",
            query.max_hops, policy.max_hops
        ));
    }
    for (name, value) in &query.params {
        if value.is_none() {
            violations.push(format!("parameter {} is unbound", name));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Graph retrieval stage: translate (when a translator is bound), validate,
/// execute; any failure degrades to the template query that token-matches
/// node labels and summaries, then expands.
pub async fn run_graph_stage(
    graph: &GraphStore,
    translator: Option<&Arc<dyn NlTranslator>>,
    policy: &GraphPolicy,
    container_id: &str,
    query_text: &str,
    max_hops_override: Option<u8>,
    neighbor_k: usize,
) -> GraphStageOutput {
    let started = Instant::now();
    let max_hops = max_hops_override
        .unwrap_or(policy.max_hops)
        .min(policy.max_hops);
    let mut output = GraphStageOutput::default();

    let translated = match translator {
        Some(translator) => {
            let schema = GraphSchemaHint {
                container_id: container_id.to_string(),
                node_labels: policy.node_labels.clone(),
                edge_types: policy.edge_types.clone(),
                max_hops,
            };
            match tokio::time::timeout(
                Duration::from_millis(policy.query_timeout_ms.max(1)),
                translator.translate(query_text, &schema),
            )
            .await
            {
                Ok(Ok(query)) => Some(query),
                Ok(Err(err)) => {
                    debug!("nl2query translation failed: {}", err);
                    output.issues.push(IssueCode::Nl2queryFailed);
                    None
                }
                Err(_) => {
                    output.issues.push(IssueCode::Nl2queryFailed);
                    None
                }
            }
        }
        None => None,
    };

    let structured = translated.and_then(|query| {
        match validate_graph_query(&query, policy, container_id) {
            Ok(()) => Some(query),
            Err(violations) => {
                debug!(?violations, "graph query rejected by validator");
                output.issues.push(IssueCode::GraphQueryInvalid);
                None
            }
        }
    });

    let seeds: Vec<(GraphNode, f32)> = match &structured {
        Some(query) => {
            let mut seeds = Vec::new();
            if !query.seed_node_ids.is_empty() {
                for node in graph.get_nodes(container_id, &query.seed_node_ids).await {
                    seeds.push((node, 1.0));
                }
            }
            if seeds.is_empty() {
                let tokens = if query.seed_tokens.is_empty() {
                    tokenize(query_text)
                } else {
                    query.seed_tokens.clone()
                };
                seeds = graph
                    .find_nodes_by_tokens(container_id, &tokens, neighbor_k)
                    .await;
            }
            if !query.node_labels.is_empty() {
                seeds.retain(|(node, _)| query.node_labels.contains(&node.node_type));
            }
            seeds
        }
        None => {
            // Template fallback path.
            if translator.is_some() {
                output.fallback = Some("template".to_string());
            }
            graph
                .find_nodes_by_tokens(container_id, &tokenize(query_text), neighbor_k)
                .await
        }
    };

    if seeds.is_empty() {
        output.execution_ms = started.elapsed().as_millis() as u64;
        return output;
    }

    let seed_ids: Vec<String> = seeds.iter().map(|(node, _)| node.id.clone()).collect();
    let (nodes, mut edges) = graph.expand(container_id, &seed_ids, max_hops).await;

    if let Some(query) = &structured {
        if !query.edge_types.is_empty() {
            edges.retain(|edge| query.edge_types.contains(&edge.edge_type));
        }
    }

    // Chunk hits: seeds keep their match score, expansion nodes ride at a
    // fraction of the weakest seed.
    let seed_scores: HashMap<&str, f32> = seeds
        .iter()
        .map(|(node, score)| (node.id.as_str(), *score))
        .collect();
    let min_seed = seeds
        .iter()
        .map(|(_, score)| *score)
        .fold(f32::MAX, f32::min);

    let mut chunk_scores: HashMap<String, f32> = HashMap::new();
    for node in &nodes {
        let score = seed_scores
            .get(node.id.as_str())
            .copied()
            .unwrap_or(min_seed * EXPANSION_SCORE_FACTOR);
        chunk_scores
            .entry(node.source_chunk_id.clone())
            .and_modify(|existing| *existing = existing.max(score))
            .or_insert(score);
    }

    let mut hits: Vec<StageHit> = chunk_scores
        .into_iter()
        .map(|(chunk_id, score)| StageHit { chunk_id, score })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    output.hits = hits;
    output.nodes = nodes;
    output.edges = edges;
    output.execution_ms = started.elapsed().as_millis() as u64;
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::AdapterError;
    use async_trait::async_trait;
    use storage::graph_store::UpsertMode;
    use tempfile::tempdir;

    fn policy() -> GraphPolicy {
        GraphPolicy {
            enabled: true,
            max_hops: 2,
            query_timeout_ms: 200,
            node_labels: vec!["Artist".to_string(), "Movement".to_string()],
            edge_types: vec!["INFLUENCED_BY".to_string()],
        }
    }

    fn valid_query() -> GraphQuery {
        GraphQuery {
            operation: GraphOperation::Match,
            container_id: Some("ct_1".to_string()),
            node_labels: vec!["Artist".to_string()],
            edge_types: Vec::new(),
            seed_tokens: vec!["kandinsky".to_string()],
            seed_node_ids: Vec::new(),
            max_hops: 2,
            params: Vec::new(),
        }
    }

    #[test]
    fn validator_accepts_read_only_in_schema_query() {
        assert!(validate_graph_query(&valid_query(), &policy(), "ct_1").is_ok());
    }

    #[test]
    fn validator_rejects_forbidden_label_mutation_depth_and_unbound_params() {
        let mut query = valid_query();
        query.node_labels.push("Critic".to_string());
        assert!(validate_graph_query(&query, &policy(), "ct_1").is_err());

        let mut query = valid_query();
        query.operation = GraphOperation::Mutation;
        assert!(validate_graph_query(&query, &policy(), "ct_1").is_err());

        let mut query = valid_query();
        query.max_hops = 5;
        assert!(validate_graph_query(&query, &policy(), "ct_1").is_err());

        let mut query = valid_query();
        query.params.push(("since".to_string(), None));
        assert!(validate_graph_query(&query, &policy(), "ct_1").is_err());

        let mut query = valid_query();
        query.container_id = None;
        assert!(validate_graph_query(&query, &policy(), "ct_1").is_err());
    }

    struct ForbiddenLabelTranslator;

    #[async_trait]
    impl NlTranslator for ForbiddenLabelTranslator {
        async fn translate(
            &self,
            _query: &str,
            schema: &GraphSchemaHint,
        ) -> Result<GraphQuery, AdapterError> {
            Ok(GraphQuery {
                operation: GraphOperation::Match,
                container_id: Some(schema.container_id.clone()),
                node_labels: vec!["Critic".to_string()],
                edge_types: Vec::new(),
                seed_tokens: Vec::new(),
                seed_node_ids: Vec::new(),
                max_hops: schema.max_hops,
                params: Vec::new(),
            })
        }
    }

    async fn seeded_graph(dir: &tempfile::TempDir) -> GraphStore {
        let graph = GraphStore::open(dir.path().join("g.wal")).await.unwrap();
        graph
            .upsert(
                "ct_1",
                vec![
                    GraphNode {
                        id: "ent_kandinsky".to_string(),
                        container_id: "ct_1".to_string(),
                        label: "Kandinsky".to_string(),
                        node_type: "Artist".to_string(),
                        summary: "Kandinsky pioneered abstraction".to_string(),
                        source_chunk_id: "ch_1".to_string(),
                    },
                    GraphNode {
                        id: "ent_blaue_reiter".to_string(),
                        container_id: "ct_1".to_string(),
                        label: "Blaue Reiter".to_string(),
                        node_type: "Movement".to_string(),
                        summary: "Munich expressionist group".to_string(),
                        source_chunk_id: "ch_2".to_string(),
                    },
                ],
                vec![GraphEdge {
                    source: "ent_kandinsky".to_string(),
                    target: "ent_blaue_reiter".to_string(),
                    edge_type: "INFLUENCED_BY".to_string(),
                    container_id: "ct_1".to_string(),
                    source_chunk_id: "ch_1".to_string(),
                }],
                UpsertMode::Merge,
            )
            .await
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn invalid_translation_falls_back_to_template_with_issue() {
        let dir = tempdir().unwrap();
        let graph = seeded_graph(&dir).await;
        let translator: Arc<dyn NlTranslator> = Arc::new(ForbiddenLabelTranslator);

        let output = run_graph_stage(
            &graph,
            Some(&translator),
            &policy(),
            "ct_1",
            "kandinsky movement",
            None,
            5,
        )
        .await;

        assert!(output.issues.contains(&IssueCode::GraphQueryInvalid));
        assert_eq!(output.fallback.as_deref(), Some("template"));
        // Template still produced graph context from token-match seeds.
        assert!(!output.nodes.is_empty());
        assert!(output.hits.iter().any(|h| h.chunk_id == "ch_1"));
    }

    #[tokio::test]
    async fn template_expansion_reaches_neighbors_within_hops() {
        let dir = tempdir().unwrap();
        let graph = seeded_graph(&dir).await;

        let output = run_graph_stage(&graph, None, &policy(), "ct_1", "kandinsky", None, 5).await;

        assert!(output.fallback.is_none());
        assert_eq!(output.nodes.len(), 2);
        assert_eq!(output.edges.len(), 1);
        let chunk_ids: Vec<&str> = output.hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert!(chunk_ids.contains(&"ch_1"));
        assert!(chunk_ids.contains(&"ch_2"));
        // The seed outranks the expansion hop.
        assert_eq!(output.hits[0].chunk_id, "ch_1");
    }

    #[tokio::test]
    async fn empty_graph_yields_no_hits_without_issues() {
        let dir = tempdir().unwrap();
        let graph = GraphStore::open(dir.path().join("g.wal")).await.unwrap();

        let output = run_graph_stage(&graph, None, &policy(), "ct_1", "anything", None, 5).await;
        assert!(output.hits.is_empty());
        assert!(output.issues.is_empty());
    }
}
