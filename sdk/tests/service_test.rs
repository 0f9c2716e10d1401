use adapters::embedder::TokenHashEmbedder;
use curio_core::audit::{AuditOperation, InMemoryAuditSink};
use curio_core::auth::{Principal, StaticTokenVerifier};
use curio_core::config::AppConfig;
use curio_core::error::ErrorCode;
use curio_core::manifest::{
    ChunkingPolicy, CollaborationPolicy, ContainerManifest, EmbedderRef, GraphPolicy,
    RerankPolicy, Visibility,
};
use curio_core::model::Modality;
use curio_sdk::service::{
    AddMode, CurioService, GraphEdgeInput, GraphNodeInput, RequestContext, ServiceHandle,
};
use curio_sdk::lifecycle::ExportPayload;
use ingestion::processor::IngestSource;
use query::engine::{GraphSearchMode, GraphSearchRequest};
use query::request::{RetrievalMode, RetrievalRequest};
use std::sync::Arc;
use std::time::Duration;
use storage::graph_store::UpsertMode;
use tempfile::tempdir;

fn test_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.data_dir = dir.path().join("data").to_string_lossy().to_string();
    config.jobs.pool_size = 2;
    config.jobs.claim_interval_ms = 20;
    config.jobs.lease_ms = 5_000;
    config
}

fn manifest(slug: &str) -> ContainerManifest {
    ContainerManifest {
        slug: slug.to_string(),
        theme: "expressionist painting".to_string(),
        description: "curated notes on the Blaue Reiter".to_string(),
        modalities: vec![Modality::Text, Modality::Pdf],
        embedder: EmbedderRef {
            id: "token-hash".to_string(),
            version: "1".to_string(),
            dims: 256,
        },
        latency_budget_ms: 1_000,
        rerank: RerankPolicy::default(),
        freshness_lambda: 0.0,
        graph: GraphPolicy {
            enabled: true,
            max_hops: 2,
            query_timeout_ms: 300,
            node_labels: vec!["Artist".to_string(), "Movement".to_string()],
            edge_types: vec!["CO_MENTIONED".to_string(), "INFLUENCED_BY".to_string()],
        },
        visibility: Visibility::Public,
        acl: Vec::new(),
        collaboration: CollaborationPolicy::SharedRead,
        semantic_dedup_threshold: 0.75,
        snippet_max_chars: 240,
        chunking: ChunkingPolicy::default(),
        thumbnail_max_edge: 2048,
    }
}

async fn open_service(dir: &tempfile::TempDir) -> (ServiceHandle, RequestContext) {
    let verifier = StaticTokenVerifier::new().with_token(
        "tok-agent",
        Principal::new("agent-7").with_scopes(["retrieve", "ingest"]),
    );
    let audit = Arc::new(InMemoryAuditSink::default());

    let handle = CurioService::open(&test_config(dir), Arc::new(verifier), audit)
        .await
        .expect("service should assemble");

    let ctx = handle
        .service
        .authenticate("Bearer tok-agent", Some("agent-7"), Some("Curator"))
        .await
        .expect("token should verify");

    (handle, ctx)
}

fn text_source(text: &str) -> IngestSource {
    IngestSource {
        inline_text: Some(text.to_string()),
        mime: Some("text/plain".to_string()),
        ..Default::default()
    }
}

async fn wait_for_job(
    handle: &ServiceHandle,
    ctx: &RequestContext,
    job_id: &str,
) -> curio_sdk::service::JobView {
    for _ in 0..200 {
        let status = handle.service.job_status(ctx, &[job_id.to_string()]).await;
        if let Some(job) = status.jobs.first() {
            if job.status == "done" || job.status == "failed" {
                return job.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} did not reach a terminal state", job_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_ingest_and_hybrid_retrieve() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    let container = service
        .create_container(&ctx, manifest("blaue-reiter"))
        .await
        .unwrap();
    assert!(container.id.starts_with("ct_"));
    assert_eq!(container.slug, "blaue-reiter");

    let added = service
        .add_sources(
            &ctx,
            "blaue-reiter",
            vec![
                text_source("Kandinsky painted his first abstract watercolor in 1910."),
                text_source("Franz Marc favored blue horses as spiritual subjects."),
            ],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();
    assert_eq!(added.jobs.len(), 2);
    assert!(added.jobs.iter().all(|job| job.status == "done"));

    let response = service
        .retrieve(
            &ctx,
            RetrievalRequest {
                query: Some("Kandinsky abstract watercolor".to_string()),
                container_ids: vec!["blaue-reiter".to_string()],
                mode: RetrievalMode::Hybrid,
                diagnostics: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.version, "1");
    assert_eq!(response.request_id, ctx.request_id);
    assert!(!response.output.partial);
    assert!(!response.output.results.is_empty());
    assert!(response.output.results[0].snippet.contains("Kandinsky"));

    let described = service
        .describe_container(&ctx, "blaue-reiter", true)
        .await
        .unwrap();
    let stats = described.stats.unwrap();
    assert_eq!(stats.document_count, 2);
    assert!(stats.last_ingest_at.is_some());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubmitting_an_identical_source_reuses_document() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    service
        .create_container(&ctx, manifest("dedup"))
        .await
        .unwrap();

    let first = service
        .add_sources(
            &ctx,
            "dedup",
            vec![text_source("Kandinsky on color.")],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();
    let first_result = first.jobs[0].result.clone().unwrap();

    let second = service
        .add_sources(
            &ctx,
            "dedup",
            vec![text_source("Kandinsky on color.")],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();
    let second_result = second.jobs[0].result.clone().unwrap();

    assert_eq!(
        first_result.get("document_id"),
        second_result.get("document_id")
    );
    assert_eq!(
        second_result.get("no_op"),
        Some(&serde_json::Value::Bool(true))
    );

    let stats = service
        .describe_container(&ctx, "dedup", true)
        .await
        .unwrap()
        .stats
        .unwrap();
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.chunk_count, 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn export_packages_a_content_addressed_artifact() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    service
        .create_container(&ctx, manifest("exportable"))
        .await
        .unwrap();
    service
        .add_sources(
            &ctx,
            "exportable",
            vec![text_source("Der Blaue Reiter almanac, 1912.")],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();

    let op = service
        .export_container(
            &ctx,
            "exportable",
            ExportPayload {
                include_vectors: true,
                include_blobs: true,
            },
        )
        .await
        .unwrap();
    let job_id = op.job_id.unwrap();

    let job = wait_for_job(&handle, &ctx, &job_id).await;
    assert_eq!(job.status, "done");
    let result = job.result.unwrap();
    let key = result.get("artifact_key").and_then(|v| v.as_str()).unwrap();
    assert!(key.starts_with("exports/"));
    assert!(key.ends_with(".tar"));
    assert_eq!(result.get("documents").and_then(|v| v.as_u64()), Some(1));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shadow_refresh_swaps_embedder_version() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    // Register the target version before asking for the refresh.
    service
        .embeddings()
        .register_text(Arc::new(TokenHashEmbedder::new("token-hash", "2", 256)))
        .unwrap();

    service
        .create_container(&ctx, manifest("refreshing"))
        .await
        .unwrap();
    service
        .add_sources(
            &ctx,
            "refreshing",
            vec![text_source("Kandinsky wrote Concerning the Spiritual in Art.")],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();

    let op = service
        .refresh_container(&ctx, "refreshing", "2".to_string())
        .await
        .unwrap();
    let job = wait_for_job(&handle, &ctx, &op.job_id.unwrap()).await;
    assert_eq!(job.status, "done");

    let described = service
        .describe_container(&ctx, "refreshing", false)
        .await
        .unwrap();
    assert_eq!(described.manifest.embedder.version, "2");

    // Retrieval still works against the swapped collection.
    let response = service
        .retrieve(
            &ctx,
            RetrievalRequest {
                query: Some("Spiritual in Art".to_string()),
                container_ids: vec!["refreshing".to_string()],
                mode: RetrievalMode::Hybrid,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!response.output.results.is_empty());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn document_delete_cascades_and_archives_block_retrieval() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    service
        .create_container(&ctx, manifest("cascade"))
        .await
        .unwrap();
    service
        .add_sources(
            &ctx,
            "cascade",
            vec![text_source("Kandinsky exhibition catalogue.")],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();

    let documents = service.list_documents(&ctx, "cascade").await.unwrap();
    assert_eq!(documents.len(), 1);

    service
        .delete_document(&ctx, &documents[0].id)
        .await
        .unwrap();
    assert!(service.list_documents(&ctx, "cascade").await.unwrap().is_empty());

    let response = service
        .retrieve(
            &ctx,
            RetrievalRequest {
                query: Some("Kandinsky catalogue".to_string()),
                container_ids: vec!["cascade".to_string()],
                mode: RetrievalMode::Hybrid,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.output.results.is_empty());

    // Soft delete archives; retrieval then rejects the container.
    service.delete_container(&ctx, "cascade", false).await.unwrap();
    let err = service
        .retrieve(
            &ctx,
            RetrievalRequest {
                query: Some("anything".to_string()),
                container_ids: vec!["cascade".to_string()],
                mode: RetrievalMode::Hybrid,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restricted_container_enforces_acl() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    let mut restricted = manifest("private");
    restricted.visibility = Visibility::Restricted;
    restricted.acl = vec!["someone-else".to_string()];
    service.create_container(&ctx, restricted).await.unwrap();

    let err = service
        .retrieve(
            &ctx,
            RetrievalRequest {
                query: Some("q".to_string()),
                container_ids: vec!["private".to_string()],
                mode: RetrievalMode::Bm25,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);

    // Restricted containers are invisible in listings too.
    let listed = service
        .list_containers(&ctx, &Default::default(), false)
        .await;
    assert!(listed.iter().all(|c| c.slug != "private"));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graph_upsert_schema_and_search_roundtrip() {
    let dir = tempdir().unwrap();
    let (handle, ctx) = open_service(&dir).await;
    let service = handle.service.clone();

    service
        .create_container(&ctx, manifest("graphed"))
        .await
        .unwrap();
    service
        .add_sources(
            &ctx,
            "graphed",
            vec![text_source("Kandinsky and the Blaue Reiter circle.")],
            AddMode::Blocking,
            Some(15_000),
        )
        .await
        .unwrap();

    let documents = service.list_documents(&ctx, "graphed").await.unwrap();
    let chunk_id = curio_core::model::derive_chunk_id(&documents[0].id, 0);

    let upserted = service
        .graph_upsert(
            &ctx,
            "graphed",
            vec![
                GraphNodeInput {
                    id: "ent_kandinsky".to_string(),
                    label: "Kandinsky".to_string(),
                    node_type: "Artist".to_string(),
                    summary: "Founder of the Blaue Reiter".to_string(),
                    source_chunk_id: chunk_id.clone(),
                },
                GraphNodeInput {
                    id: "ent_blaue_reiter".to_string(),
                    label: "Blaue Reiter".to_string(),
                    node_type: "Movement".to_string(),
                    summary: "Expressionist circle in Munich".to_string(),
                    source_chunk_id: chunk_id.clone(),
                },
            ],
            vec![GraphEdgeInput {
                source: "ent_kandinsky".to_string(),
                target: "ent_blaue_reiter".to_string(),
                edge_type: "INFLUENCED_BY".to_string(),
                source_chunk_id: chunk_id.clone(),
            }],
            UpsertMode::Merge,
        )
        .await
        .unwrap();
    assert_eq!(upserted.nodes_upserted, 2);
    assert_eq!(upserted.edges_upserted, 1);

    let schema = service.graph_schema(&ctx, "graphed").await.unwrap();
    assert_eq!(schema.node_count, 2);
    assert!(schema.node_labels.contains(&"Artist".to_string()));

    let found = service
        .graph_search(
            &ctx,
            GraphSearchRequest {
                container: "graphed".to_string(),
                query: Some("Kandinsky".to_string()),
                mode: GraphSearchMode::Nl,
                max_hops: Some(2),
                k: 5,
                expand_from_vector: false,
            },
        )
        .await
        .unwrap();
    assert!(!found.nodes.is_empty());
    assert!(found.chunk_ids.contains(&chunk_id));

    // Unknown provenance chunk is a validation fault, not a crash.
    let err = service
        .graph_upsert(
            &ctx,
            "graphed",
            vec![GraphNodeInput {
                id: "ent_orphan".to_string(),
                label: "Orphan".to_string(),
                node_type: "Artist".to_string(),
                summary: String::new(),
                source_chunk_id: "ch_does_not_exist".to_string(),
            }],
            vec![],
            UpsertMode::Merge,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn system_reports_and_audit_trail() {
    let dir = tempdir().unwrap();
    let verifier = StaticTokenVerifier::new()
        .with_token("tok-agent", Principal::new("agent-7"));
    let audit = Arc::new(InMemoryAuditSink::default());
    let handle = CurioService::open(&test_config(&dir), Arc::new(verifier), audit.clone())
        .await
        .unwrap();
    let service = handle.service.clone();

    let ctx = service
        .authenticate("tok-agent", Some("agent-9"), None)
        .await
        .unwrap();

    assert_eq!(service.system().health().status, "ok");
    let ready = service.system().ready().await;
    assert!(ready.ready && ready.registry && ready.blob);

    service
        .create_container(&ctx, manifest("audited"))
        .await
        .unwrap();
    let status = service.system().status().await;
    assert_eq!(status.containers, 1);
    assert!(!status.embedder_down);

    let events = audit.events().unwrap();
    assert!(events
        .iter()
        .any(|e| e.operation == AuditOperation::Lifecycle
            && e.agent_id.as_deref() == Some("agent-9")));

    // Bad token is an auth fault with a typed code.
    let err = service.authenticate("nope", None, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthenticated);

    handle.shutdown().await;
}
