//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! two-line config file is enough for local experiments:
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//! ```
//!
//! Secrets are never read from this file. API keys come from the process
//! environment (`OPENAI_API_KEY`, `PINECONE_API_KEY`) when the provider that
//! needs them is constructed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::redact::PiiKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where uploads live and what may be uploaded.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_upload_mb: default_max_upload_mb(),
            allowed_types: default_allowed_types(),
        }
    }
}

impl StorageConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_max_upload_mb() -> u64 {
    50
}
fn default_allowed_types() -> Vec<String> {
    [
        "pdf", "docx", "pptx", "xlsx", "txt", "md", "html", "png", "jpg", "jpeg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    250
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Sensitive-data masking applied between extraction and chunking.
#[derive(Debug, Deserialize, Clone)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subset of `password, api_key, credit_card, ssn, email, phone, address`.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Optional remote classifier consulted after the pattern rules.
    #[serde(default)]
    pub classifier_url: Option<String>,
    #[serde(default = "default_classifier_timeout")]
    pub classifier_timeout_secs: u64,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            categories: default_categories(),
            classifier_url: None,
            classifier_timeout_secs: default_classifier_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_categories() -> Vec<String> {
    PiiKind::ALL.iter().map(|k| k.as_str().to_string()).collect()
}
fn default_classifier_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `sqlite`, `memory`, or `pinecone`.
    #[serde(default = "default_index_provider")]
    pub provider: String,
    /// Data-plane host of a Pinecone index, e.g. `https://docs-abc123.svc.pinecone.io`.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            host: None,
            namespace: default_namespace(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_provider() -> String {
    "sqlite".to_string()
}
fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HierarchyConfig {
    /// Enqueue a tree build after every successful indexing run.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_pages_per_node")]
    pub max_pages_per_node: usize,
    #[serde(default = "default_max_chars_per_node")]
    pub max_chars_per_node: usize,
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pages_per_node: default_max_pages_per_node(),
            max_chars_per_node: default_max_chars_per_node(),
            beam_width: default_beam_width(),
            summary_chars: default_summary_chars(),
        }
    }
}

fn default_max_pages_per_node() -> usize {
    10
}
fn default_max_chars_per_node() -> usize {
    6000
}
fn default_beam_width() -> usize {
    3
}
fn default_summary_chars() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum cosine similarity for a chunk to ground an answer.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `extractive`, or `openai`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_answer_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            base_url: None,
            max_context_chars: default_max_context_chars(),
            max_tokens: default_max_answer_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_context_chars() -> usize {
    8000
}
fn default_max_answer_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.1
}
fn default_generation_timeout() -> u64 {
    60
}

/// Background job execution.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Number of documents processed concurrently by one worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Run workers inside `kb serve`.
    #[serde(default = "default_true")]
    pub embedded: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// How long a claimed job or document lock stays valid without renewal.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    /// Concurrent embedding batches per document.
    #[serde(default = "default_parallel_embeddings")]
    pub parallel_embeddings: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            embedded: true,
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            extract_timeout_secs: default_extract_timeout_secs(),
            parallel_embeddings: default_parallel_embeddings(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    5
}
fn default_backoff_max_secs() -> u64 {
    300
}
fn default_lease_secs() -> u64 {
    600
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_extract_timeout_secs() -> u64 {
    120
}
fn default_parallel_embeddings() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Per-module level overrides, e.g. `knowledge_base::worker = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            modules: HashMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Config with every section at its default and the database at
    /// `./data/kb.sqlite`. Used by commands that can run without a file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/kb.sqlite"),
            },
            storage: StorageConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            redaction: RedactionConfig::default(),
            index: IndexConfig::default(),
            hierarchy: HierarchyConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            worker: WorkerConfig::default(),
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
        }
        if self.storage.max_upload_mb == 0 {
            anyhow::bail!("storage.max_upload_mb must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" | "hash" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0");
            }
            let needs_model_and_dims = matches!(self.embedding.provider.as_str(), "openai" | "ollama");
            if needs_model_and_dims && (self.embedding.model.is_none() || self.embedding.dims.is_none()) {
                anyhow::bail!(
                    "embedding.model and embedding.dims must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        for category in &self.redaction.categories {
            if PiiKind::parse(category).is_none() {
                anyhow::bail!("Unknown redaction category: '{}'", category);
            }
        }

        match self.index.provider.as_str() {
            "sqlite" | "memory" => {}
            "pinecone" => {
                if self.index.host.is_none() {
                    anyhow::bail!("index.host must be set when index.provider is 'pinecone'");
                }
            }
            other => anyhow::bail!(
                "Unknown index provider: '{}'. Must be sqlite, memory, or pinecone.",
                other
            ),
        }

        if self.hierarchy.max_pages_per_node == 0 || self.hierarchy.beam_width == 0 {
            anyhow::bail!("hierarchy.max_pages_per_node and hierarchy.beam_width must be > 0");
        }

        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
        }

        match self.generation.provider.as_str() {
            "disabled" | "extractive" | "openai" => {}
            other => anyhow::bail!(
                "Unknown generation provider: '{}'. Must be disabled, extractive, or openai.",
                other
            ),
        }

        if self.worker.concurrency == 0 || self.worker.parallel_embeddings == 0 {
            anyhow::bail!("worker.concurrency and worker.parallel_embeddings must be >= 1");
        }
        if self.worker.max_attempts == 0 {
            anyhow::bail!("worker.max_attempts must be >= 1");
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => anyhow::bail!("Unknown logging.format: '{}'. Must be pretty or json.", other),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
