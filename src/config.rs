use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// Values parsed individually but violate a cross-field invariant.
    #[error("Invalid pipeline configuration: {0}")]
    Invariant(String),
}

/// Runtime configuration for the Rusty RAG server and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the index snapshot, document store and query log.
    pub storage_dir: Option<PathBuf>,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Text generator backing answers.
    pub generator_provider: GeneratorProvider,
    /// Generation model identifier passed to the provider.
    pub llm_model: String,
    /// Base URL of the Ollama runtime.
    pub ollama_url: String,
    /// Relevance model used by the optional reranking stage.
    pub reranker_provider: RerankerProvider,
    /// Base URL of the cross-encoder service when `reranker_provider` is `http`.
    pub reranker_url: Option<String>,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Chunking, retrieval and upstream call settings.
    pub pipeline: PipelineConfig,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Deterministic offline feature-hashing embedder.
    Hashing,
    /// Local Ollama runtime.
    Ollama,
}

/// Supported answer generators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneratorProvider {
    /// Offline generator that answers with the best supporting passage.
    Extractive,
    /// Local Ollama runtime.
    Ollama,
}

/// Relevance models available to the reranking stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RerankerProvider {
    /// Reranking disabled; retrieval order is final.
    None,
    /// Offline term-overlap relevance model.
    Lexical,
    /// Cross-encoder served over HTTP (`POST /rerank`).
    Http,
}

/// Where the similarity threshold is applied relative to reranking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStage {
    /// Filter on vector similarity right after retrieval.
    BeforeRerank,
    /// Filter on reranker scores; equivalent to `BeforeRerank` when reranking is disabled.
    AfterRerank,
}

/// Validated knobs that drive chunking, retrieval and upstream calls.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Maximum tokens per chunk.
    pub chunk_size: usize,
    /// Tokens carried from the previous chunk.
    pub chunk_overlap: usize,
    /// Default number of candidates requested from the index.
    pub top_k: usize,
    /// Upper bound accepted for per-request `top_k` overrides.
    pub max_top_k: usize,
    /// Number of candidates kept after reranking.
    pub rerank_top_n: usize,
    /// Minimum score a chunk needs to reach the prompt.
    pub similarity_threshold: f32,
    /// Whether the reranking stage runs at all.
    pub reranker_enabled: bool,
    /// Stage at which the threshold is applied.
    pub threshold_stage: ThresholdStage,
    /// Bound applied to each embedder/generator/reranker attempt.
    pub upstream_timeout: Duration,
    /// Extra attempts granted to transient upstream failures.
    pub max_retries: u32,
    /// Permits in the worker pool shared by queries and ingestions.
    pub max_concurrency: usize,
    /// Characters of chunk text returned with each source (`None` returns full text).
    pub source_preview_chars: Option<usize>,
    /// Persist index and store after every successful write.
    pub autosave: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            top_k: 5,
            max_top_k: 20,
            rerank_top_n: 3,
            similarity_threshold: 0.3,
            reranker_enabled: false,
            threshold_stage: ThresholdStage::BeforeRerank,
            upstream_timeout: Duration::from_secs(120),
            max_retries: 1,
            max_concurrency: 8,
            source_preview_chars: Some(500),
            autosave: true,
        }
    }
}

impl PipelineConfig {
    /// Check cross-field invariants once, before the pipeline is constructed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invariant("chunk_size must be greater than zero".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::Invariant(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 || self.top_k > self.max_top_k {
            return Err(ConfigError::Invariant(format!(
                "top_k must be within 1..={}",
                self.max_top_k
            )));
        }
        if self.rerank_top_n == 0 || self.rerank_top_n > self.top_k {
            return Err(ConfigError::Invariant(format!(
                "rerank_top_n ({}) must be within 1..=top_k ({})",
                self.rerank_top_n, self.top_k
            )));
        }
        if !self.similarity_threshold.is_finite() {
            return Err(ConfigError::Invariant("similarity_threshold must be finite".into()));
        }
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::Invariant("upstream_timeout must be non-zero".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invariant("max_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = PipelineConfig::default();
        let reranker_provider = parse_optional("RERANKER_PROVIDER")?.unwrap_or(RerankerProvider::None);
        let pipeline = PipelineConfig {
            chunk_size: parse_optional("CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            chunk_overlap: parse_optional("CHUNK_OVERLAP")?.unwrap_or(defaults.chunk_overlap),
            top_k: parse_optional("TOP_K")?.unwrap_or(defaults.top_k),
            max_top_k: parse_optional("MAX_TOP_K")?.unwrap_or(defaults.max_top_k),
            rerank_top_n: parse_optional("RERANK_TOP_N")?.unwrap_or(defaults.rerank_top_n),
            similarity_threshold: parse_optional("SIMILARITY_THRESHOLD")?
                .unwrap_or(defaults.similarity_threshold),
            reranker_enabled: reranker_provider != RerankerProvider::None,
            threshold_stage: parse_optional("THRESHOLD_STAGE")?.unwrap_or(defaults.threshold_stage),
            upstream_timeout: parse_optional::<u64>("UPSTREAM_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            max_retries: parse_optional("UPSTREAM_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            max_concurrency: parse_optional("MAX_CONCURRENCY")?.unwrap_or(defaults.max_concurrency),
            source_preview_chars: defaults.source_preview_chars,
            autosave: parse_optional("RAG_AUTOSAVE")?.unwrap_or(defaults.autosave),
        };
        pipeline.validate()?;

        let reranker_url = load_env_optional("RERANKER_URL");
        if reranker_provider == RerankerProvider::Http && reranker_url.is_none() {
            return Err(ConfigError::MissingVariable("RERANKER_URL".into()));
        }

        let embedding_dimension: usize = parse_optional("EMBEDDING_DIMENSION")?.unwrap_or(384);
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }

        Ok(Self {
            storage_dir: load_env_optional("RAG_STORAGE_DIR").map(PathBuf::from),
            embedding_provider: parse_optional("EMBEDDING_PROVIDER")?
                .unwrap_or(EmbeddingProvider::Hashing),
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            embedding_dimension,
            generator_provider: parse_optional("GENERATOR_PROVIDER")?
                .unwrap_or(GeneratorProvider::Extractive),
            llm_model: load_env_optional("LLM_MODEL")
                .unwrap_or_else(|| "qwen2.5:7b-instruct".to_string()),
            ollama_url: load_env_optional("OLLAMA_URL")
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
            reranker_provider,
            reranker_url,
            server_port: parse_optional("SERVER_PORT")?,
            pipeline,
        })
    }
}

/// Load configuration after reading a `.env` file when one is present.
pub fn load_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        storage_dir = ?config.storage_dir,
        embedding_provider = ?config.embedding_provider,
        embedding_dimension = config.embedding_dimension,
        generator_provider = ?config.generator_provider,
        reranker_provider = ?config.reranker_provider,
        chunk_size = config.pipeline.chunk_size,
        chunk_overlap = config.pipeline.chunk_overlap,
        "Loaded configuration"
    );
    Ok(config)
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hashing" | "hash" => Ok(Self::Hashing),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

impl FromStr for GeneratorProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extractive" => Ok(Self::Extractive),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

impl FromStr for RerankerProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" | "disabled" => Ok(Self::None),
            "lexical" => Ok(Self::Lexical),
            "http" => Ok(Self::Http),
            _ => Err(()),
        }
    }
}

impl FromStr for ThresholdStage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "before_rerank" => Ok(Self::BeforeRerank),
            "after_rerank" => Ok(Self::AfterRerank),
            _ => Err(()),
        }
    }
}
