use crate::index::AdjacencyGraph;
use crate::journal::{Journal, JournalError};
use curio_core::model::{GraphEdge, GraphNode};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Serialization error")]
    Serialization,
    #[error("Deserialization error")]
    Deserialization,
    #[error("invalid graph data: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    Merge,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GraphSchema {
    pub node_labels: Vec<String>,
    pub edge_types: Vec<String>,
    pub node_count: usize,
    pub edge_count: usize,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
enum GraphLogEntry {
    Upsert {
        container_id: String,
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
    },
    Replace {
        container_id: String,
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
    },
    DeleteContainer {
        container_id: String,
    },
    DeleteBySourceChunks {
        container_id: String,
        chunk_ids: Vec<String>,
    },
}

#[derive(Default)]
struct ContainerGraph {
    nodes: HashMap<String, GraphNode>,
    /// Keyed by (source, target, type) so repeated extraction merges edges.
    edges: HashMap<(String, String, String), GraphEdge>,
    adjacency: AdjacencyGraph,
}

impl ContainerGraph {
    fn upsert(&mut self, nodes: &[GraphNode], edges: &[GraphEdge]) {
        for node in nodes {
            self.nodes.insert(node.id.clone(), node.clone());
        }
        for edge in edges {
            let key = (
                edge.source.clone(),
                edge.target.clone(),
                edge.edge_type.clone(),
            );
            self.adjacency.add_edge(&edge.source, &edge.target, &edge.edge_type);
            self.edges.insert(key, edge.clone());
        }
    }

    fn remove_by_source_chunks(&mut self, chunk_ids: &HashSet<&str>) {
        let doomed: Vec<String> = self
            .nodes
            .values()
            .filter(|n| chunk_ids.contains(n.source_chunk_id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        for id in &doomed {
            self.nodes.remove(id);
            self.adjacency.remove_node(id);
        }
        self.edges.retain(|_, edge| {
            !chunk_ids.contains(edge.source_chunk_id.as_str())
                && !doomed.contains(&edge.source)
                && !doomed.contains(&edge.target)
        });
        // Rebuild adjacency from the surviving edge set; edge-only removals
        // are not expressible on the adjacency list directly.
        let mut adjacency = AdjacencyGraph::new();
        for edge in self.edges.values() {
            adjacency.add_edge(&edge.source, &edge.target, &edge.edge_type);
        }
        self.adjacency = adjacency;
    }
}

/// Per-container entity/relation graph keyed by `source_chunk_id` for
/// provenance. Merge-by-id upserts; edges merge by (source, target, type).
pub struct GraphStore {
    journal: Mutex<Journal>,
    state: RwLock<HashMap<String, ContainerGraph>>,
}

impl GraphStore {
    pub async fn open(journal_path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let (journal, frames) = Journal::open(journal_path).await?;

        let mut state: HashMap<String, ContainerGraph> = HashMap::new();
        for (_seq, data) in frames {
            let archived = rkyv::check_archived_root::<GraphLogEntry>(&data[..])
                .map_err(|_| GraphError::Deserialization)?;
            let entry: GraphLogEntry = archived
                .deserialize(&mut rkyv::Infallible)
                .map_err(|_| GraphError::Deserialization)?;
            apply_entry(&mut state, entry);
        }

        Ok(Self {
            journal: Mutex::new(journal),
            state: RwLock::new(state),
        })
    }

    async fn log(&self, entry: &GraphLogEntry) -> Result<(), GraphError> {
        let mut serializer = AllocSerializer::<1024>::default();
        serializer
            .serialize_value(entry)
            .map_err(|_| GraphError::Serialization)?;
        let bytes = serializer.into_serializer().into_inner();

        let mut journal = self.journal.lock().await;
        journal.append(&bytes).await?;
        journal.commit().await?;
        Ok(())
    }

    /// Provenance closure is the caller's contract: every node and edge must
    /// name a chunk in the same container. The store rejects edges whose
    /// endpoints are unknown after the upsert.
    pub async fn upsert(
        &self,
        container_id: &str,
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
        mode: UpsertMode,
    ) -> Result<(usize, usize), GraphError> {
        let mut state = self.state.write().await;

        {
            let graph = state.entry(container_id.to_string()).or_default();
            let known: HashSet<&str> = match mode {
                UpsertMode::Merge => graph
                    .nodes
                    .keys()
                    .map(|k| k.as_str())
                    .chain(nodes.iter().map(|n| n.id.as_str()))
                    .collect(),
                UpsertMode::Replace => nodes.iter().map(|n| n.id.as_str()).collect(),
            };
            for edge in &edges {
                if !known.contains(edge.source.as_str()) || !known.contains(edge.target.as_str()) {
                    return Err(GraphError::Invalid(format!(
                        "edge {} -> {} references unknown node",
                        edge.source, edge.target
                    )));
                }
            }
        }

        let entry = match mode {
            UpsertMode::Merge => GraphLogEntry::Upsert {
                container_id: container_id.to_string(),
                nodes: nodes.clone(),
                edges: edges.clone(),
            },
            UpsertMode::Replace => GraphLogEntry::Replace {
                container_id: container_id.to_string(),
                nodes: nodes.clone(),
                edges: edges.clone(),
            },
        };
        self.log(&entry).await?;

        let graph = state.entry(container_id.to_string()).or_default();
        if mode == UpsertMode::Replace {
            *graph = ContainerGraph::default();
        }
        graph.upsert(&nodes, &edges);
        Ok((nodes.len(), edges.len()))
    }

    pub async fn delete_container(&self, container_id: &str) -> Result<(), GraphError> {
        let mut state = self.state.write().await;
        if !state.contains_key(container_id) {
            return Ok(());
        }
        self.log(&GraphLogEntry::DeleteContainer {
            container_id: container_id.to_string(),
        })
        .await?;
        state.remove(container_id);
        Ok(())
    }

    /// Cascade for document/chunk deletion.
    pub async fn delete_by_source_chunks(
        &self,
        container_id: &str,
        chunk_ids: &[String],
    ) -> Result<(), GraphError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let Some(graph) = state.get_mut(container_id) else {
            return Ok(());
        };

        self.log(&GraphLogEntry::DeleteBySourceChunks {
            container_id: container_id.to_string(),
            chunk_ids: chunk_ids.to_vec(),
        })
        .await?;

        let doomed: HashSet<&str> = chunk_ids.iter().map(|s| s.as_str()).collect();
        graph.remove_by_source_chunks(&doomed);
        Ok(())
    }

    pub async fn get_nodes(&self, container_id: &str, ids: &[String]) -> Vec<GraphNode> {
        let state = self.state.read().await;
        let Some(graph) = state.get(container_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| graph.nodes.get(id).cloned())
            .collect()
    }

    /// Token match over label and summary, for the template fallback path.
    /// Score is the fraction of query tokens found.
    pub async fn find_nodes_by_tokens(
        &self,
        container_id: &str,
        tokens: &[String],
        k: usize,
    ) -> Vec<(GraphNode, f32)> {
        if tokens.is_empty() {
            return Vec::new();
        }
        let state = self.state.read().await;
        let Some(graph) = state.get(container_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(GraphNode, f32)> = graph
            .nodes
            .values()
            .filter_map(|node| {
                let haystack =
                    format!("{} {}", node.label, node.summary).to_lowercase();
                let matched = tokens
                    .iter()
                    .filter(|t| haystack.contains(t.as_str()))
                    .count();
                (matched > 0).then(|| (node.clone(), matched as f32 / tokens.len() as f32))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        scored
    }

    /// Seed lookup for hybrid-graph retrieval: nodes extracted from any of
    /// the given chunks.
    pub async fn find_nodes_by_source_chunks(
        &self,
        container_id: &str,
        chunk_ids: &[String],
    ) -> Vec<GraphNode> {
        let state = self.state.read().await;
        let Some(graph) = state.get(container_id) else {
            return Vec::new();
        };
        let wanted: HashSet<&str> = chunk_ids.iter().map(|s| s.as_str()).collect();
        let mut out: Vec<GraphNode> = graph
            .nodes
            .values()
            .filter(|n| wanted.contains(n.source_chunk_id.as_str()))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// BFS expansion from seed nodes, bounded by max_hops. Returns the
    /// subgraph: reached nodes (seeds included) and the edges among them.
    pub async fn expand(
        &self,
        container_id: &str,
        seeds: &[String],
        max_hops: u8,
    ) -> (Vec<GraphNode>, Vec<GraphEdge>) {
        let state = self.state.read().await;
        let Some(graph) = state.get(container_id) else {
            return (Vec::new(), Vec::new());
        };

        let mut included: BTreeSet<String> = seeds
            .iter()
            .filter(|id| graph.nodes.contains_key(*id))
            .cloned()
            .collect();
        for seed in seeds {
            for (node_id, _hops) in graph.adjacency.expand(seed, max_hops) {
                if graph.nodes.contains_key(&node_id) {
                    included.insert(node_id);
                }
            }
        }

        let nodes: Vec<GraphNode> = included
            .iter()
            .filter_map(|id| graph.nodes.get(id).cloned())
            .collect();
        let mut edges: Vec<GraphEdge> = graph
            .edges
            .values()
            .filter(|e| included.contains(&e.source) && included.contains(&e.target))
            .cloned()
            .collect();
        edges.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.target.cmp(&b.target))
                .then_with(|| a.edge_type.cmp(&b.edge_type))
        });

        (nodes, edges)
    }

    pub async fn schema(&self, container_id: &str) -> GraphSchema {
        let state = self.state.read().await;
        let Some(graph) = state.get(container_id) else {
            return GraphSchema {
                node_labels: Vec::new(),
                edge_types: Vec::new(),
                node_count: 0,
                edge_count: 0,
            };
        };

        let node_labels: BTreeSet<String> = graph
            .nodes
            .values()
            .map(|n| n.node_type.clone())
            .collect();
        let edge_types: BTreeSet<String> = graph
            .edges
            .values()
            .map(|e| e.edge_type.clone())
            .collect();

        GraphSchema {
            node_labels: node_labels.into_iter().collect(),
            edge_types: edge_types.into_iter().collect(),
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
        }
    }

    pub async fn is_empty(&self, container_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .get(container_id)
            .map(|g| g.nodes.is_empty())
            .unwrap_or(true)
    }
}

fn apply_entry(state: &mut HashMap<String, ContainerGraph>, entry: GraphLogEntry) {
    match entry {
        GraphLogEntry::Upsert {
            container_id,
            nodes,
            edges,
        } => {
            state
                .entry(container_id)
                .or_default()
                .upsert(&nodes, &edges);
        }
        GraphLogEntry::Replace {
            container_id,
            nodes,
            edges,
        } => {
            let graph = state.entry(container_id).or_default();
            *graph = ContainerGraph::default();
            graph.upsert(&nodes, &edges);
        }
        GraphLogEntry::DeleteContainer { container_id } => {
            state.remove(&container_id);
        }
        GraphLogEntry::DeleteBySourceChunks {
            container_id,
            chunk_ids,
        } => {
            if let Some(graph) = state.get_mut(&container_id) {
                let doomed: HashSet<&str> = chunk_ids.iter().map(|s| s.as_str()).collect();
                graph.remove_by_source_chunks(&doomed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node(id: &str, label: &str, node_type: &str, chunk: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            container_id: "ct_1".to_string(),
            label: label.to_string(),
            node_type: node_type.to_string(),
            summary: format!("{} is discussed here", label),
            source_chunk_id: chunk.to_string(),
        }
    }

    fn edge(source: &str, target: &str, edge_type: &str, chunk: &str) -> GraphEdge {
        GraphEdge {
            source: source.to_string(),
            target: target.to_string(),
            edge_type: edge_type.to_string(),
            container_id: "ct_1".to_string(),
            source_chunk_id: chunk.to_string(),
        }
    }

    #[tokio::test]
    async fn merge_upsert_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.journal")).await.unwrap();

        let nodes = vec![
            node("ent_kandinsky", "Kandinsky", "Artist", "ch_1"),
            node("ent_bauhaus", "Bauhaus", "Movement", "ch_1"),
        ];
        let edges = vec![edge("ent_kandinsky", "ent_bauhaus", "MEMBER_OF", "ch_1")];

        store
            .upsert("ct_1", nodes.clone(), edges.clone(), UpsertMode::Merge)
            .await
            .unwrap();
        store
            .upsert("ct_1", nodes, edges, UpsertMode::Merge)
            .await
            .unwrap();

        let schema = store.schema("ct_1").await;
        assert_eq!(schema.node_count, 2);
        assert_eq!(schema.edge_count, 1);
        assert_eq!(schema.node_labels, vec!["Artist", "Movement"]);
        assert_eq!(schema.edge_types, vec!["MEMBER_OF"]);
    }

    #[tokio::test]
    async fn edges_require_known_endpoints() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.journal")).await.unwrap();

        let err = store
            .upsert(
                "ct_1",
                vec![node("ent_a", "A", "Artist", "ch_1")],
                vec![edge("ent_a", "ent_missing", "KNOWS", "ch_1")],
                UpsertMode::Merge,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Invalid(_)));
    }

    #[tokio::test]
    async fn expand_returns_bounded_subgraph() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.journal")).await.unwrap();

        store
            .upsert(
                "ct_1",
                vec![
                    node("ent_a", "A", "Artist", "ch_1"),
                    node("ent_b", "B", "Artist", "ch_1"),
                    node("ent_c", "C", "Artist", "ch_1"),
                ],
                vec![
                    edge("ent_a", "ent_b", "KNOWS", "ch_1"),
                    edge("ent_b", "ent_c", "KNOWS", "ch_1"),
                ],
                UpsertMode::Merge,
            )
            .await
            .unwrap();

        let (nodes, edges) = store.expand("ct_1", &["ent_a".to_string()], 1).await;
        assert_eq!(nodes.len(), 2);
        assert_eq!(edges.len(), 1);

        let (nodes, edges) = store.expand("ct_1", &["ent_a".to_string()], 2).await;
        assert_eq!(nodes.len(), 3);
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_source_chunks_cascades() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.journal")).await.unwrap();

        store
            .upsert(
                "ct_1",
                vec![
                    node("ent_a", "A", "Artist", "ch_1"),
                    node("ent_b", "B", "Artist", "ch_2"),
                ],
                vec![edge("ent_a", "ent_b", "KNOWS", "ch_1")],
                UpsertMode::Merge,
            )
            .await
            .unwrap();

        store
            .delete_by_source_chunks("ct_1", &["ch_1".to_string()])
            .await
            .unwrap();

        let schema = store.schema("ct_1").await;
        assert_eq!(schema.node_count, 1);
        assert_eq!(schema.edge_count, 0);
    }

    #[tokio::test]
    async fn graph_survives_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graph.journal");

        {
            let store = GraphStore::open(&path).await.unwrap();
            store
                .upsert(
                    "ct_1",
                    vec![node("ent_a", "Kandinsky", "Artist", "ch_1")],
                    vec![],
                    UpsertMode::Merge,
                )
                .await
                .unwrap();
        }

        let store = GraphStore::open(&path).await.unwrap();
        let found = store
            .find_nodes_by_tokens("ct_1", &["kandinsky".to_string()], 5)
            .await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn replace_mode_clears_previous_graph() {
        let dir = tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.journal")).await.unwrap();

        store
            .upsert(
                "ct_1",
                vec![node("ent_a", "A", "Artist", "ch_1")],
                vec![],
                UpsertMode::Merge,
            )
            .await
            .unwrap();
        store
            .upsert(
                "ct_1",
                vec![node("ent_b", "B", "Movement", "ch_2")],
                vec![],
                UpsertMode::Replace,
            )
            .await
            .unwrap();

        let schema = store.schema("ct_1").await;
        assert_eq!(schema.node_count, 1);
        assert_eq!(schema.node_labels, vec!["Movement"]);
    }
}
