use adapters::extract::EntityExtractor;
use adapters::guard::{guarded, CircuitBreaker};
use adapters::AdapterError;
use curio_core::model::{derive_entity_id, GraphEdge, GraphNode, Job, JobKind};
use jobs::{JobFailure, JobHandler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::graph_store::{GraphStore, UpsertMode};
use storage::registry::Registry;
use tracing::{debug, info};

const SUMMARY_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphExtractPayload {
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphExtractOutcome {
    pub nodes_upserted: usize,
    pub edges_upserted: usize,
    pub chunks_processed: usize,
}

/// Best-effort entity/relation extraction running as its own job kind so
/// ingest latency stays bounded by embed time. Node ids derive from the
/// normalized name and type, which makes repeated extraction a merge.
pub struct GraphBuilder {
    registry: Arc<Registry>,
    graph: Arc<GraphStore>,
    extractor: Arc<dyn EntityExtractor>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl GraphBuilder {
    pub fn new(
        registry: Arc<Registry>,
        graph: Arc<GraphStore>,
        extractor: Arc<dyn EntityExtractor>,
        timeout: Duration,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
    ) -> Self {
        Self {
            registry,
            graph,
            extractor,
            breaker: CircuitBreaker::new("extractor", breaker_threshold, breaker_cooldown),
            timeout,
        }
    }

    pub async fn build_for_document(
        &self,
        document_id: &str,
    ) -> Result<GraphExtractOutcome, JobFailure> {
        let Some(document) = self.registry.get_document(document_id).await else {
            // Deleted between enqueue and execution; nothing to extract.
            return Ok(GraphExtractOutcome {
                nodes_upserted: 0,
                edges_upserted: 0,
                chunks_processed: 0,
            });
        };
        let container_id = document.container_id.clone();

        let chunks = self.registry.chunks_by_document(document_id).await;
        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        let mut edges: HashMap<(String, String, String), GraphEdge> = HashMap::new();
        let mut processed = 0usize;

        // Deduped chunks share text with their canonical peer; extracting
        // from canonicals covers the content once.
        for chunk in chunks.iter().filter(|c| c.is_canonical() && !c.text.is_empty()) {
            let extraction = guarded(
                &self.breaker,
                self.timeout,
                self.extractor.extract(&chunk.text),
            )
            .await
            .map_err(map_adapter_failure)?;
            processed += 1;

            let mut ids_by_text: HashMap<&str, String> = HashMap::new();
            for entity in &extraction.entities {
                let node_id = derive_entity_id(
                    &container_id,
                    &entity.text.to_lowercase(),
                    &entity.label,
                );
                ids_by_text.insert(entity.text.as_str(), node_id.clone());
                nodes.entry(node_id.clone()).or_insert_with(|| GraphNode {
                    id: node_id,
                    container_id: container_id.clone(),
                    label: entity.text.clone(),
                    node_type: entity.label.clone(),
                    summary: summarize(&chunk.text),
                    source_chunk_id: chunk.id.clone(),
                });
            }

            for relation in &extraction.relations {
                let (Some(source), Some(target)) = (
                    ids_by_text.get(relation.source.as_str()),
                    ids_by_text.get(relation.target.as_str()),
                ) else {
                    debug!("relation endpoint missing from extraction, skipping");
                    continue;
                };
                let key = (source.clone(), target.clone(), relation.relation.clone());
                edges.entry(key).or_insert_with(|| GraphEdge {
                    source: source.clone(),
                    target: target.clone(),
                    edge_type: relation.relation.clone(),
                    container_id: container_id.clone(),
                    source_chunk_id: chunk.id.clone(),
                });
            }
        }

        let node_list: Vec<GraphNode> = nodes.into_values().collect();
        let edge_list: Vec<GraphEdge> = edges.into_values().collect();
        let (nodes_upserted, edges_upserted) = self
            .graph
            .upsert(&container_id, node_list, edge_list, UpsertMode::Merge)
            .await
            .map_err(|err| JobFailure::retryable(anyhow::anyhow!(err)))?;

        info!(
            container_id = %container_id,
            document_id,
            nodes_upserted,
            edges_upserted,
            "graph extraction merged"
        );

        Ok(GraphExtractOutcome {
            nodes_upserted,
            edges_upserted,
            chunks_processed: processed,
        })
    }
}

fn map_adapter_failure(err: AdapterError) -> JobFailure {
    match err {
        AdapterError::Down(_) | AdapterError::Timeout(_) | AdapterError::RateLimited => {
            JobFailure::retryable(anyhow::anyhow!(err))
        }
        other => JobFailure::permanent(anyhow::anyhow!(other)),
    }
}

fn summarize(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(SUMMARY_MAX_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

#[async_trait::async_trait]
impl JobHandler for GraphBuilder {
    fn kind(&self) -> JobKind {
        JobKind::GraphExtract
    }

    async fn execute(&self, job: &Job) -> Result<serde_json::Value, JobFailure> {
        let payload: GraphExtractPayload = serde_json::from_str(&job.payload_json)
            .map_err(|err| JobFailure::permanent(anyhow::anyhow!("bad payload: {}", err)))?;

        let outcome = self.build_for_document(&payload.document_id).await?;
        serde_json::to_value(outcome)
            .map_err(|err| JobFailure::permanent(anyhow::anyhow!(err)))
    }
}
