use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Jina,
    Cohere,
    Openai,
    Bedrock,
    Local,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub http_port: u16,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,

    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    /// Model sequence limit in tokens; texts beyond ~4 chars/token of this are rejected.
    #[serde(default = "default_embedding_max_model_len")]
    pub embedding_max_model_len: usize,
    /// Filesystem path of the tokenizer definition used for chunking.
    #[serde(default)]
    pub embedding_tokenizer_path: Option<String>,

    #[serde(default)]
    pub jina_api_key: String,
    #[serde(default = "default_jina_api_url")]
    pub jina_api_url: String,
    #[serde(default)]
    pub cohere_api_key: String,
    #[serde(default = "default_cohere_api_url")]
    pub cohere_api_url: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_batch_min_documents")]
    pub embedding_batch_min_documents: usize,
    #[serde(default = "default_batch_max_documents")]
    pub embedding_batch_max_documents: usize,
    #[serde(default = "default_batch_accumulation_timeout")]
    pub embedding_batch_accumulation_timeout_seconds: u64,
    #[serde(default = "default_batch_accumulation_poll")]
    pub embedding_batch_accumulation_poll_interval: u64,
    #[serde(default = "default_batch_monitor_poll")]
    pub embedding_batch_monitor_poll_interval: u64,

    #[serde(default = "default_stale_sync_timeout")]
    pub stale_sync_timeout_minutes: i64,
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,
    #[serde(default = "default_max_concurrent_syncs_per_type")]
    pub max_concurrent_syncs_per_type: usize,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_embedding_provider() -> EmbeddingBackend {
    EmbeddingBackend::Openai
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1024
}

fn default_embedding_max_model_len() -> usize {
    8192
}

fn default_jina_api_url() -> String {
    "https://api.jina.ai/v1/embeddings".to_string()
}

fn default_cohere_api_url() -> String {
    "https://api.cohere.com/v2/embed".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_batch_min_documents() -> usize {
    100
}

fn default_batch_max_documents() -> usize {
    50_000
}

fn default_batch_accumulation_timeout() -> u64 {
    300
}

fn default_batch_accumulation_poll() -> u64 {
    10
}

fn default_batch_monitor_poll() -> u64 {
    30
}

fn default_stale_sync_timeout() -> i64 {
    30
}

fn default_max_concurrent_syncs() -> usize {
    10
}

fn default_max_concurrent_syncs_per_type() -> usize {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: String::new(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: String::new(),
            surrealdb_database: String::new(),
            data_dir: default_data_dir(),
            http_port: 0,
            storage: default_storage_kind(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            embedding_max_model_len: default_embedding_max_model_len(),
            embedding_tokenizer_path: None,
            jina_api_key: String::new(),
            jina_api_url: default_jina_api_url(),
            cohere_api_key: String::new(),
            cohere_api_url: default_cohere_api_url(),
            openai_api_key: String::new(),
            openai_base_url: default_openai_base_url(),
            embedding_batch_min_documents: default_batch_min_documents(),
            embedding_batch_max_documents: default_batch_max_documents(),
            embedding_batch_accumulation_timeout_seconds: default_batch_accumulation_timeout(),
            embedding_batch_accumulation_poll_interval: default_batch_accumulation_poll(),
            embedding_batch_monitor_poll_interval: default_batch_monitor_poll(),
            stale_sync_timeout_minutes: default_stale_sync_timeout(),
            max_concurrent_syncs: default_max_concurrent_syncs(),
            max_concurrent_syncs_per_type: default_max_concurrent_syncs_per_type(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
