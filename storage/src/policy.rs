use crate::registry::Registry;
use curio_core::manifest::{ManifestError, Policy};
use curio_core::model::Container;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Invalid(#[from] ManifestError),
}

struct CachedContainer {
    container: Container,
    fetched_at: Instant,
}

/// Read-mostly resolver in front of the registry. Containers are cached for
/// a short TTL; lifecycle mutations must call `invalidate`.
pub struct PolicyResolver {
    registry: Arc<Registry>,
    global_budget_ms: u64,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedContainer>>,
}

impl PolicyResolver {
    pub fn new(registry: Arc<Registry>, global_budget_ms: u64, ttl: Duration) -> Self {
        Self {
            registry,
            global_budget_ms,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn global_budget_ms(&self) -> u64 {
        self.global_budget_ms
    }

    /// Resolve a container (by id or slug) into the per-request policy.
    pub async fn resolve(
        &self,
        id_or_slug: &str,
        request_budget_ms: Option<u64>,
    ) -> Result<Policy, PolicyError> {
        let container = self.load(id_or_slug).await?;
        container.manifest.validate()?;
        Ok(container.manifest.resolve(
            &container.id,
            container.state,
            request_budget_ms,
            self.global_budget_ms,
        ))
    }

    async fn load(&self, id_or_slug: &str) -> Result<Container, PolicyError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(id_or_slug) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.container.clone());
                }
            }
        }

        let container = self
            .registry
            .find_container(id_or_slug)
            .await
            .ok_or_else(|| PolicyError::NotFound(id_or_slug.to_string()))?;

        let mut cache = self.cache.write().await;
        let entry = CachedContainer {
            container: container.clone(),
            fetched_at: Instant::now(),
        };
        // Cache under both addresses so id and slug lookups stay warm.
        cache.insert(container.id.clone(), CachedContainer {
            container: container.clone(),
            fetched_at: entry.fetched_at,
        });
        cache.insert(container.manifest.slug.clone(), entry);

        Ok(container)
    }

    /// Drop the cached entry for a container; every manifest mutation (graph
    /// schema changes included) goes through here.
    pub async fn invalidate(&self, container: &Container) {
        let mut cache = self.cache.write().await;
        cache.remove(&container.id);
        cache.remove(&container.manifest.slug);
    }

    pub async fn invalidate_key(&self, id_or_slug: &str) {
        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.remove(id_or_slug) {
            cache.remove(&cached.container.id);
            cache.remove(&cached.container.manifest.slug);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOp;
    use curio_core::manifest::{
        ChunkingPolicy, CollaborationPolicy, ContainerManifest, EmbedderRef, GraphPolicy,
        RerankPolicy, Visibility,
    };
    use curio_core::model::{now_ms, ContainerState, Modality};
    use tempfile::tempdir;

    fn container(id: &str, slug: &str, budget: u64) -> Container {
        let now = now_ms();
        Container {
            id: id.to_string(),
            manifest: ContainerManifest {
                slug: slug.to_string(),
                theme: "theme".to_string(),
                description: String::new(),
                modalities: vec![Modality::Text],
                embedder: EmbedderRef {
                    id: "local-hash".to_string(),
                    version: "1".to_string(),
                    dims: 16,
                },
                latency_budget_ms: budget,
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
            },
            state: ContainerState::Active,
            stats: Default::default(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    #[tokio::test]
    async fn resolves_by_id_and_slug_with_min_budget() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("r.wal")).await.unwrap());
        registry
            .apply(vec![RegistryOp::PutContainer(container("ct_1", "art", 800))])
            .await
            .unwrap();

        let resolver = PolicyResolver::new(registry, 2_000, Duration::from_secs(30));

        let by_id = resolver.resolve("ct_1", None).await.unwrap();
        assert_eq!(by_id.budget_ms, 800);

        let by_slug = resolver.resolve("art", Some(300)).await.unwrap();
        assert_eq!(by_slug.budget_ms, 300);
        assert_eq!(by_slug.container_id, "ct_1");
    }

    #[tokio::test]
    async fn unknown_container_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("r.wal")).await.unwrap());
        let resolver = PolicyResolver::new(registry, 2_000, Duration::from_secs(30));

        let err = resolver.resolve("nope", None).await.unwrap_err();
        assert!(matches!(err, PolicyError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalidate_picks_up_mutations() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("r.wal")).await.unwrap());
        let original = container("ct_1", "art", 800);
        registry
            .apply(vec![RegistryOp::PutContainer(original.clone())])
            .await
            .unwrap();

        let resolver =
            PolicyResolver::new(registry.clone(), 2_000, Duration::from_secs(3_600));
        assert_eq!(resolver.resolve("ct_1", None).await.unwrap().budget_ms, 800);

        let mut updated = container("ct_1", "art", 400);
        updated.created_at_ms = original.created_at_ms;
        registry
            .apply(vec![RegistryOp::PutContainer(updated.clone())])
            .await
            .unwrap();

        // Still cached until invalidated.
        assert_eq!(resolver.resolve("ct_1", None).await.unwrap().budget_ms, 800);
        resolver.invalidate(&updated).await;
        assert_eq!(resolver.resolve("ct_1", None).await.unwrap().budget_ms, 400);
    }
}
