use crate::embedder::{ImageEmbedder, TextEmbedder};
use crate::guard::{guarded, CircuitBreaker, TokenBucket};
use crate::registry::AdapterRegistry;
use crate::AdapterError;
use curio_core::manifest::EmbedderRef;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Embedding front door shared by ingestion and retrieval. Resolves the
/// container's pinned embedder from the registries, then runs the call under
/// breaker + deadline. The token bucket throttles write-path (ingestion)
/// calls only; the retrieval critical path never waits and never retries.
pub struct EmbeddingService {
    text: RwLock<AdapterRegistry<dyn TextEmbedder>>,
    image: RwLock<AdapterRegistry<dyn ImageEmbedder>>,
    breaker: CircuitBreaker,
    limiter: TokenBucket,
    timeout: Duration,
}

impl EmbeddingService {
    pub fn new(
        text: AdapterRegistry<dyn TextEmbedder>,
        image: AdapterRegistry<dyn ImageEmbedder>,
        timeout: Duration,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
        ingest_rate_per_s: u32,
    ) -> Self {
        Self {
            text: RwLock::new(text),
            image: RwLock::new(image),
            breaker: CircuitBreaker::new("embedder", breaker_threshold, breaker_cooldown),
            limiter: TokenBucket::new(ingest_rate_per_s.max(1), ingest_rate_per_s.max(1)),
            timeout,
        }
    }

    pub fn register_text(
        &self,
        embedder: Arc<dyn TextEmbedder>,
    ) -> Result<(), crate::registry::RegistryError> {
        let id = embedder.id().to_string();
        let version = embedder.version().to_string();
        self.text.write().unwrap().register(id, version, embedder)
    }

    pub fn register_image(
        &self,
        embedder: Arc<dyn ImageEmbedder>,
    ) -> Result<(), crate::registry::RegistryError> {
        let id = embedder.id().to_string();
        let version = embedder.version().to_string();
        self.image.write().unwrap().register(id, version, embedder)
    }

    pub fn is_down(&self) -> bool {
        self.breaker.is_open()
    }

    fn resolve_text(&self, embedder: &EmbedderRef) -> Result<Arc<dyn TextEmbedder>, AdapterError> {
        self.text
            .read()
            .unwrap()
            .resolve(&embedder.id, Some(&embedder.version))
            .map(|resolved| resolved.adapter)
            .map_err(|err| AdapterError::Request(err.to_string()))
    }

    fn resolve_image(
        &self,
        embedder: &EmbedderRef,
    ) -> Result<Arc<dyn ImageEmbedder>, AdapterError> {
        self.image
            .read()
            .unwrap()
            .resolve(&embedder.id, Some(&embedder.version))
            .map(|resolved| resolved.adapter)
            .map_err(|err| AdapterError::Request(err.to_string()))
    }

    /// `throttled` marks write-path callers (ingestion workers).
    pub async fn embed_texts(
        &self,
        embedder: &EmbedderRef,
        texts: &[String],
        throttled: bool,
    ) -> Result<Vec<Vec<f32>>, AdapterError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let adapter = self.resolve_text(embedder)?;
        if throttled {
            self.limiter.acquire().await;
        }
        guarded(&self.breaker, self.timeout, adapter.embed_text(texts)).await
    }

    pub async fn embed_image(
        &self,
        embedder: &EmbedderRef,
        bytes: &[u8],
        throttled: bool,
    ) -> Result<Vec<f32>, AdapterError> {
        let adapter = self.resolve_image(embedder)?;
        if throttled {
            self.limiter.acquire().await;
        }
        guarded(&self.breaker, self.timeout, adapter.embed_image(bytes)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::TokenHashEmbedder;
    use async_trait::async_trait;

    struct FailingEmbedder;

    #[async_trait]
    impl TextEmbedder for FailingEmbedder {
        fn id(&self) -> &str {
            "failing"
        }
        fn version(&self) -> &str {
            "1"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed_text(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError> {
            Err(AdapterError::Request("boom".to_string()))
        }
    }

    fn service() -> EmbeddingService {
        EmbeddingService::new(
            AdapterRegistry::new(),
            AdapterRegistry::new(),
            Duration::from_millis(500),
            2,
            Duration::from_millis(100),
            100,
        )
    }

    fn embedder_ref(id: &str) -> EmbedderRef {
        EmbedderRef {
            id: id.to_string(),
            version: "1".to_string(),
            dims: 8,
        }
    }

    #[tokio::test]
    async fn embeds_through_registered_adapter() {
        let service = service();
        service
            .register_text(Arc::new(TokenHashEmbedder::new("token-hash", "1", 8)))
            .unwrap();

        let vectors = service
            .embed_texts(&embedder_ref("token-hash"), &["hello".to_string()], false)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 8);
    }

    #[tokio::test]
    async fn unknown_embedder_is_an_error_not_a_panic() {
        let service = service();
        let err = service
            .embed_texts(&embedder_ref("nope"), &["hello".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Request(_)));
    }

    #[tokio::test]
    async fn repeated_failures_open_the_breaker() {
        let service = service();
        service.register_text(Arc::new(FailingEmbedder)).unwrap();
        let texts = vec!["x".to_string()];

        for _ in 0..2 {
            let _ = service
                .embed_texts(&embedder_ref("failing"), &texts, false)
                .await;
        }
        assert!(service.is_down());

        let err = service
            .embed_texts(&embedder_ref("failing"), &texts, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Down(_)));
    }
}
