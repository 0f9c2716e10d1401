use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub journal_sync_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Global ceiling applied on top of the per-container budget.
    pub global_budget_ms: u64,
    /// Margin reserved for fusion and rendering inside the budget.
    pub budget_safety_ms: u64,
    pub admission_limit: usize,
    pub admission_wait_ms: u64,
    pub rrf_k0: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobsConfig {
    /// 0 means "use the CPU count".
    pub pool_size: usize,
    pub claim_interval_ms: u64,
    pub lease_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdapterConfig {
    pub embed_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    pub translate_timeout_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub ingest_rate_per_s: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    pub embedding_ttl_s: u64,
    pub rerank_ttl_s: u64,
    pub policy_ttl_s: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub jobs: JobsConfig,
    pub adapters: AdapterConfig,
    pub cache: CacheConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 7171,
            },
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                journal_sync_interval_ms: 50,
            },
            retrieval: RetrievalConfig {
                global_budget_ms: 2_000,
                budget_safety_ms: 50,
                admission_limit: 64,
                admission_wait_ms: 100,
                rrf_k0: 60.0,
            },
            jobs: JobsConfig {
                pool_size: 0,
                claim_interval_ms: 1_000,
                lease_ms: 30_000,
                max_attempts: 5,
                backoff_base_ms: 2_000,
                backoff_cap_ms: 300_000,
            },
            adapters: AdapterConfig {
                embed_timeout_ms: 1_500,
                rerank_timeout_ms: 800,
                translate_timeout_ms: 800,
                breaker_threshold: 5,
                breaker_cooldown_ms: 10_000,
                ingest_rate_per_s: 20,
            },
            cache: CacheConfig {
                embedding_ttl_s: 86_400,
                rerank_ttl_s: 600,
                policy_ttl_s: 30,
            },
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("CURIO").separator("__"));

        builder.build()?.try_deserialize()
    }
}
