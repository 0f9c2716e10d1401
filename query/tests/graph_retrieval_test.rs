use adapters::embedder::TokenHashEmbedder;
use adapters::registry::AdapterRegistry;
use adapters::service::EmbeddingService;
use adapters::translate::{GraphOperation, GraphQuery, GraphSchemaHint, NlTranslator};
use adapters::AdapterError;
use async_trait::async_trait;
use curio_core::error::IssueCode;
use curio_core::manifest::{
    ChunkingPolicy, CollaborationPolicy, ContainerManifest, EmbedderRef, GraphPolicy,
    RerankPolicy, Visibility,
};
use curio_core::model::{
    derive_chunk_id, derive_document_id, now_ms, Chunk, Container, ContainerState, Document,
    DocumentState, GraphEdge, GraphNode, Modality,
};
use query::engine::{
    EngineConfig, GraphSearchMode, GraphSearchRequest, RetrievalEngine,
};
use query::request::{GraphOptions, RetrievalMode, RetrievalRequest};
use std::sync::Arc;
use std::time::Duration;
use storage::graph_store::{GraphStore, UpsertMode};
use storage::policy::PolicyResolver;
use storage::registry::{Registry, RegistryOp};
use storage::vector::{VectorPayload, VectorStore};
use tempfile::tempdir;

struct GraphStack {
    registry: Arc<Registry>,
    vectors: Arc<VectorStore>,
    graph: Arc<GraphStore>,
    policies: Arc<PolicyResolver>,
    embeddings: Arc<EmbeddingService>,
}

fn manifest() -> ContainerManifest {
    ContainerManifest {
        slug: "movements".to_string(),
        theme: "art movements".to_string(),
        description: String::new(),
        modalities: vec![Modality::Text],
        embedder: EmbedderRef {
            id: "token-hash".to_string(),
            version: "1".to_string(),
            dims: 128,
        },
        latency_budget_ms: 1_000,
        rerank: RerankPolicy::default(),
        freshness_lambda: 0.0,
        graph: GraphPolicy {
            enabled: true,
            max_hops: 2,
            query_timeout_ms: 300,
            node_labels: vec!["Artist".to_string(), "Movement".to_string()],
            edge_types: vec!["INFLUENCED_BY".to_string()],
        },
        visibility: Visibility::Public,
        acl: Vec::new(),
        collaboration: CollaborationPolicy::SharedRead,
        semantic_dedup_threshold: 0.92,
        snippet_max_chars: 200,
        chunking: ChunkingPolicy::default(),
        thumbnail_max_edge: 2048,
    }
}

async fn seed(dir: &tempfile::TempDir) -> GraphStack {
    let registry = Arc::new(Registry::open(dir.path().join("r.wal")).await.unwrap());
    let vectors = Arc::new(VectorStore::open(dir.path().join("v.wal")).await.unwrap());
    let graph = Arc::new(GraphStore::open(dir.path().join("g.wal")).await.unwrap());

    let now = now_ms();
    registry
        .apply(vec![RegistryOp::PutContainer(Container {
            id: "ct_mov".to_string(),
            manifest: manifest(),
            state: ContainerState::Active,
            stats: Default::default(),
            created_at_ms: now,
            updated_at_ms: now,
        })])
        .await
        .unwrap();
    vectors.create_collection("c_ct_mov", 128).await.unwrap();

    // Two documents, one chunk each, plus the entity graph they back.
    let texts = [
        ("hash-k", "Kandinsky led the Blaue Reiter toward abstraction."),
        ("hash-m", "The Blaue Reiter movement shaped German Expressionism."),
    ];
    let embedder = TokenHashEmbedder::new("token-hash", "1", 128);
    let mut chunk_ids = Vec::new();
    for (hash, text) in texts {
        let document = Document {
            id: derive_document_id("ct_mov", hash),
            container_id: "ct_mov".to_string(),
            uri: format!("inline://{}", hash),
            mime: "text/plain".to_string(),
            content_hash: hash.to_string(),
            title: hash.to_string(),
            modality: Modality::Text,
            ingested_at_ms: now,
            fetcher: "inline".to_string(),
            original_path: None,
            chunk_count: 1,
            state: DocumentState::Active,
        };
        let chunk = Chunk {
            id: derive_chunk_id(&document.id, 0),
            document_id: document.id.clone(),
            container_id: "ct_mov".to_string(),
            modality: Modality::Text,
            ordinal: 0,
            text: text.to_string(),
            char_start: 0,
            char_end: text.chars().count() as u64,
            page: None,
            dedup_of: None,
            embedder_id: "token-hash".to_string(),
            embedder_version: "1".to_string(),
            created_at_ms: now,
        };
        chunk_ids.push(chunk.id.clone());

        use adapters::embedder::TextEmbedder;
        let vector = embedder
            .embed_text(&[text.to_string()])
            .await
            .unwrap()
            .remove(0);
        registry
            .apply(vec![
                RegistryOp::PutDocument(document.clone()),
                RegistryOp::PutChunk(chunk.clone()),
            ])
            .await
            .unwrap();
        vectors
            .upsert(
                "c_ct_mov",
                &chunk.id,
                vector,
                VectorPayload {
                    container_id: "ct_mov".to_string(),
                    document_id: document.id,
                    modality: Modality::Text,
                    title: hash.to_string(),
                    uri: format!("inline://{}", hash),
                    ingested_at_ms: now,
                },
            )
            .await
            .unwrap();
    }

    graph
        .upsert(
            "ct_mov",
            vec![
                GraphNode {
                    id: "ent_kandinsky".to_string(),
                    container_id: "ct_mov".to_string(),
                    label: "Kandinsky".to_string(),
                    node_type: "Artist".to_string(),
                    summary: "Kandinsky, painter of early abstraction".to_string(),
                    source_chunk_id: chunk_ids[0].clone(),
                },
                GraphNode {
                    id: "ent_blaue_reiter".to_string(),
                    container_id: "ct_mov".to_string(),
                    label: "Blaue Reiter".to_string(),
                    node_type: "Movement".to_string(),
                    summary: "Expressionist circle in Munich".to_string(),
                    source_chunk_id: chunk_ids[1].clone(),
                },
            ],
            vec![GraphEdge {
                source: "ent_kandinsky".to_string(),
                target: "ent_blaue_reiter".to_string(),
                edge_type: "INFLUENCED_BY".to_string(),
                container_id: "ct_mov".to_string(),
                source_chunk_id: chunk_ids[0].clone(),
            }],
            UpsertMode::Merge,
        )
        .await
        .unwrap();

    let policies = Arc::new(PolicyResolver::new(
        registry.clone(),
        2_000,
        Duration::from_secs(30),
    ));
    let embeddings = Arc::new(EmbeddingService::new(
        AdapterRegistry::new(),
        AdapterRegistry::new(),
        Duration::from_millis(500),
        5,
        Duration::from_secs(10),
        1_000,
    ));
    embeddings
        .register_text(Arc::new(TokenHashEmbedder::new("token-hash", "1", 128)))
        .unwrap();

    GraphStack {
        registry,
        vectors,
        graph,
        policies,
        embeddings,
    }
}

fn engine(stack: &GraphStack) -> RetrievalEngine {
    RetrievalEngine::new(
        stack.policies.clone(),
        stack.registry.clone(),
        stack.vectors.clone(),
        stack.graph.clone(),
        stack.embeddings.clone(),
        EngineConfig::default(),
    )
}

/// Translator that always references a label outside the schema, forcing the
/// validator to reject and the template path to serve.
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

#[tokio::test]
async fn hybrid_graph_attaches_graph_context_to_results() {
    let dir = tempdir().unwrap();
    let stack = seed(&dir).await;
    let engine = engine(&stack);

    let output = engine
        .retrieve(RetrievalRequest {
            query: Some("Kandinsky Blaue Reiter".to_string()),
            container_ids: vec!["movements".to_string()],
            mode: RetrievalMode::HybridGraph,
            diagnostics: true,
            graph: Some(GraphOptions {
                max_hops: Some(2),
                neighbor_k: 5,
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!output.results.is_empty());
    let context = output.graph_context.expect("graph context expected");
    assert_eq!(context.nodes.len(), 2);
    assert_eq!(context.edges.len(), 1);
    assert_eq!(context.snippets.len(), 2);

    let graph_diag = output.diagnostics.graph.expect("graph diagnostics");
    assert_eq!(graph_diag.node_count, 2);
    assert_eq!(graph_diag.edge_count, 1);
}

#[tokio::test]
async fn rejected_translation_still_serves_from_template_fallback() {
    let dir = tempdir().unwrap();
    let stack = seed(&dir).await;
    let engine = engine(&stack).with_translator(Arc::new(ForbiddenLabelTranslator));

    let output = engine
        .retrieve(RetrievalRequest {
            query: Some("Kandinsky movement influence".to_string()),
            container_ids: vec!["movements".to_string()],
            mode: RetrievalMode::Graph,
            diagnostics: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(output.issues.contains(&IssueCode::GraphQueryInvalid));
    let graph_diag = output.diagnostics.graph.expect("graph diagnostics");
    assert_eq!(graph_diag.fallback.as_deref(), Some("template"));

    // Graph context still derived from text-match seeds.
    let context = output.graph_context.expect("graph context expected");
    assert!(!context.nodes.is_empty());
    assert!(!output.results.is_empty());
}

#[tokio::test]
async fn graph_search_expand_from_vector_seeds_reaches_neighbors() {
    let dir = tempdir().unwrap();
    let stack = seed(&dir).await;
    let engine = engine(&stack);

    let output = engine
        .graph_search(GraphSearchRequest {
            container: "movements".to_string(),
            query: Some("Kandinsky abstraction".to_string()),
            mode: GraphSearchMode::Expand,
            max_hops: Some(2),
            k: 5,
            expand_from_vector: true,
        })
        .await
        .unwrap();

    assert!(!output.nodes.is_empty());
    assert!(!output.chunk_ids.is_empty());
}

#[tokio::test]
async fn graph_search_requires_graph_enabled_container() {
    let dir = tempdir().unwrap();
    let stack = seed(&dir).await;

    let mut container = stack.registry.get_container("ct_mov").await.unwrap();
    container.manifest.graph.enabled = false;
    stack
        .registry
        .apply(vec![RegistryOp::PutContainer(container.clone())])
        .await
        .unwrap();
    stack.policies.invalidate(&container).await;

    let engine = engine(&stack);
    let err = engine
        .graph_search(GraphSearchRequest {
            container: "movements".to_string(),
            query: Some("anything".to_string()),
            mode: GraphSearchMode::Nl,
            max_hops: None,
            k: 5,
            expand_from_vector: false,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, query::engine::RetrievalError::Invalid(_)));
}
