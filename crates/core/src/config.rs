//! Configuration management for knowbase.
//!
//! Configuration is merged from, in increasing precedence:
//! - Built-in defaults
//! - The YAML config file (`.knowbase/config.yaml` or `KNOWBASE_CONFIG`)
//! - Environment variables
//! - Command-line flags
//!
//! All persistent state lives under the workspace's `.knowbase/` directory
//! unless `work_dir` points elsewhere.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{AppError, AppResult};

/// Embedding providers the model crate knows how to build.
pub const KNOWN_EMBEDDING_PROVIDERS: [&str; 3] = ["mock", "ollama", "openai"];

/// Rerank providers the model crate knows how to build.
pub const KNOWN_RERANK_PROVIDERS: [&str; 5] = ["mock", "openai", "siliconflow", "vllm", "dashscope"];

/// Vector metrics Milvus collections may be indexed with.
pub const MILVUS_METRICS: [&str; 3] = ["COSINE", "IP", "L2"];

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the workspace root (contains .knowbase/)
    pub workspace: PathBuf,

    /// Optional config file path
    pub config_file: Option<PathBuf>,

    /// Explicit data directory; defaults to `<workspace>/.knowbase/data`
    pub work_dir: Option<PathBuf>,

    /// Log level override
    pub log_level: Option<String>,

    /// Verbose mode (enables debug logging)
    pub verbose: bool,

    /// Disable colored output
    pub no_color: bool,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Chroma REST server settings
    pub chroma: ChromaSettings,

    /// Milvus REST server settings
    pub milvus: MilvusSettings,

    /// Default embedding model for new knowledge bases
    pub embedding: EmbeddingSettings,

    /// Default reranker, if any
    pub reranker: Option<RerankerSettings>,

    /// Web page ingestion limits
    pub url_fetch: UrlFetchSettings,
}

/// Chroma server connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChromaSettings {
    #[serde(default = "default_chroma_url")]
    pub url: String,

    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

/// Milvus server connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MilvusSettings {
    #[serde(default = "default_milvus_uri")]
    pub uri: String,

    /// Bearer token (`user:password` or API key)
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_milvus_database")]
    pub database: String,

    /// Index and search metric: COSINE, IP or L2
    #[serde(default = "default_milvus_metric")]
    pub metric_type: String,

    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

/// Embedding model defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSettings {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Maximum texts per embedding request
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Timeout applied to each embedding batch
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Embedding batches in flight at once
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,
}

/// Reranker defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankerSettings {
    pub provider: String,

    pub model: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
}

/// Web page ingestion. An empty whitelist disables URL ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UrlFetchSettings {
    /// Allowed hosts; `example.com` also admits subdomains, as does `*.example.com`
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Permit hosts resolving to private, loopback or link-local addresses
    #[serde(default)]
    pub allow_private_hosts: bool,

    #[serde(default = "default_max_download_size")]
    pub max_download_size: usize,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    #[serde(default = "default_url_timeout")]
    pub timeout_secs: u64,
}

fn default_chroma_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_milvus_uri() -> String {
    "http://localhost:19530".to_string()
}

fn default_milvus_database() -> String {
    "default".to_string()
}

fn default_milvus_metric() -> String {
    "COSINE".to_string()
}

fn default_backend_timeout() -> u64 {
    10
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_dimension() -> usize {
    768
}

fn default_embedding_batch_size() -> usize {
    64
}

fn default_embedding_timeout() -> u64 {
    60
}

fn default_embedding_concurrency() -> usize {
    4
}

fn default_rerank_timeout() -> u64 {
    30
}

fn default_max_download_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_redirects() -> usize {
    5
}

fn default_url_timeout() -> u64 {
    30
}

impl Default for ChromaSettings {
    fn default() -> Self {
        Self {
            url: default_chroma_url(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

impl Default for MilvusSettings {
    fn default() -> Self {
        Self {
            uri: default_milvus_uri(),
            token: None,
            database: default_milvus_database(),
            metric_type: default_milvus_metric(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            base_url: None,
            api_key_env: None,
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout(),
            concurrency: default_embedding_concurrency(),
        }
    }
}

impl Default for UrlFetchSettings {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            allow_private_hosts: false,
            max_download_size: default_max_download_size(),
            max_redirects: default_max_redirects(),
            timeout_secs: default_url_timeout(),
        }
    }
}

/// Full configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    workspace: Option<WorkspaceConfig>,
    logging: Option<LoggingConfig>,
    chroma: Option<ChromaSettings>,
    milvus: Option<MilvusSettings>,
    embedding: Option<EmbeddingSettings>,
    reranker: Option<RerankerSettings>,
    url_fetch: Option<UrlFetchSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceConfig {
    path: Option<String>,
    work_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingConfig {
    level: Option<String>,
    color: Option<bool>,
    json: Option<bool>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            work_dir: None,
            log_level: None,
            verbose: false,
            no_color: false,
            json_logs: false,
            chroma: ChromaSettings::default(),
            milvus: MilvusSettings::default(),
            embedding: EmbeddingSettings::default(),
            reranker: None,
            url_fetch: UrlFetchSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and defaults.
    ///
    /// Environment variables:
    /// - `KNOWBASE_WORKSPACE`: Override workspace path
    /// - `KNOWBASE_CONFIG`: Path to config file
    /// - `KNOWBASE_WORK_DIR`: Data directory
    /// - `KNOWBASE_CHROMA_URL`, `KNOWBASE_MILVUS_URI`, `KNOWBASE_MILVUS_TOKEN`
    /// - `KNOWBASE_EMBED_PROVIDER`, `KNOWBASE_EMBED_MODEL`
    /// - `KNOWBASE_RERANK_URL`
    /// - `KNOWBASE_URL_WHITELIST`: Comma-separated hosts allowed for URL ingestion
    /// - `RUST_LOG`: Log level
    /// - `NO_COLOR`: Disable colored output
    ///
    /// # Example
    /// ```no_run
    /// use knowbase_core::config::AppConfig;
    ///
    /// let config = AppConfig::load().expect("Failed to load config");
    /// println!("Data dir: {:?}", config.data_dir());
    /// ```
    pub fn load() -> AppResult<Self> {
        Self::load_from(None, None)
    }

    /// Load configuration, letting explicit paths win over the environment.
    ///
    /// The CLI passes its `--workspace`/`--config` flags here so the YAML file
    /// of the requested workspace is the one that gets merged.
    pub fn load_from(workspace: Option<PathBuf>, config_file: Option<PathBuf>) -> AppResult<Self> {
        let mut config = Self::default();

        if let Ok(workspace) = std::env::var("KNOWBASE_WORKSPACE") {
            config.workspace = PathBuf::from(workspace);
        }
        if let Some(workspace) = workspace {
            config.workspace = workspace;
        }

        if let Ok(config_file) = std::env::var("KNOWBASE_CONFIG") {
            config.config_file = Some(PathBuf::from(config_file));
        }
        if let Some(config_file) = config_file {
            config.config_file = Some(config_file);
        }

        if !config.workspace.exists() {
            return Err(AppError::Config(format!(
                "Workspace directory does not exist: {:?}",
                config.workspace
            )));
        }

        let config_path = match config.config_file {
            Some(ref cf) => cf.clone(),
            None => config.workspace.join(".knowbase/config.yaml"),
        };

        if config_path.exists() {
            config = config.merge_yaml(&config_path)?;
        }

        config.apply_env();
        Ok(config)
    }

    /// Environment variables override YAML config.
    fn apply_env(&mut self) {
        if let Ok(work_dir) = std::env::var("KNOWBASE_WORK_DIR") {
            self.work_dir = Some(PathBuf::from(work_dir));
        }
        if let Ok(url) = std::env::var("KNOWBASE_CHROMA_URL") {
            self.chroma.url = url;
        }
        if let Ok(uri) = std::env::var("KNOWBASE_MILVUS_URI") {
            self.milvus.uri = uri;
        }
        if let Ok(token) = std::env::var("KNOWBASE_MILVUS_TOKEN") {
            self.milvus.token = Some(token);
        }
        if let Ok(provider) = std::env::var("KNOWBASE_EMBED_PROVIDER") {
            self.embedding.provider = provider;
        }
        if let Ok(model) = std::env::var("KNOWBASE_EMBED_MODEL") {
            self.embedding.model = model;
        }
        if let Ok(url) = std::env::var("KNOWBASE_RERANK_URL") {
            if let Some(ref mut reranker) = self.reranker {
                reranker.base_url = Some(url);
            }
        }
        if let Ok(hosts) = std::env::var("KNOWBASE_URL_WHITELIST") {
            self.url_fetch.whitelist = parse_host_list(&hosts);
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.log_level = Some(level);
        }
        if std::env::var("NO_COLOR").is_ok() {
            self.no_color = true;
        }
    }

    /// Merge YAML configuration file into this config.
    fn merge_yaml(&self, path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config_file: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        let mut result = self.clone();

        if let Some(ws) = config_file.workspace {
            if let Some(path) = ws.path {
                result.workspace = PathBuf::from(path);
            }
            if let Some(work_dir) = ws.work_dir {
                result.work_dir = Some(PathBuf::from(work_dir));
            }
        }

        if let Some(logging) = config_file.logging {
            if let Some(level) = logging.level {
                result.log_level = Some(level);
            }
            if let Some(color) = logging.color {
                result.no_color = !color;
            }
            if let Some(json) = logging.json {
                result.json_logs = json;
            }
        }

        if let Some(chroma) = config_file.chroma {
            result.chroma = chroma;
        }
        if let Some(milvus) = config_file.milvus {
            result.milvus = milvus;
        }
        if let Some(embedding) = config_file.embedding {
            result.embedding = embedding;
        }
        if config_file.reranker.is_some() {
            result.reranker = config_file.reranker;
        }
        if let Some(url_fetch) = config_file.url_fetch {
            result.url_fetch = url_fetch;
        }

        Ok(result)
    }

    /// Apply CLI overrides to the configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        workspace: Option<PathBuf>,
        config_file: Option<PathBuf>,
        work_dir: Option<PathBuf>,
        log_level: Option<String>,
        verbose: bool,
        no_color: bool,
        json_logs: bool,
    ) -> Self {
        if let Some(workspace) = workspace {
            self.workspace = workspace;
        }

        if let Some(config_file) = config_file {
            self.config_file = Some(config_file);
        }

        if let Some(work_dir) = work_dir {
            self.work_dir = Some(work_dir);
        }

        if let Some(log_level) = log_level {
            self.log_level = Some(log_level);
        }

        if verbose {
            self.verbose = true;
            // Verbose mode implies debug logging
            if self.log_level.is_none() {
                self.log_level = Some("debug".to_string());
            }
        }

        if no_color {
            self.no_color = true;
        }

        if json_logs {
            self.json_logs = true;
        }

        self
    }

    /// Get the path to the .knowbase directory.
    pub fn knowbase_dir(&self) -> PathBuf {
        self.workspace.join(".knowbase")
    }

    /// Directory holding metadata documents and per-backend working dirs.
    pub fn data_dir(&self) -> PathBuf {
        match self.work_dir {
            Some(ref dir) => dir.clone(),
            None => self.knowbase_dir().join("data"),
        }
    }

    /// Ensure the data directory exists.
    pub fn ensure_work_dir(&self) -> AppResult<()> {
        let dir = self.data_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AppError::Config(format!("Failed to create data directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }

    /// Resolve the embedding API key from its environment variable.
    pub fn embedding_api_key(&self) -> Option<String> {
        self.embedding
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
    }

    /// Validate the merged configuration.
    pub fn validate(&self) -> AppResult<()> {
        let provider = self.embedding.provider.as_str();
        if !KNOWN_EMBEDDING_PROVIDERS.contains(&provider) {
            return Err(AppError::Config(format!(
                "Unknown embedding provider: {}. Supported: {}",
                provider,
                KNOWN_EMBEDDING_PROVIDERS.join(", ")
            )));
        }

        if self.embedding.dimension == 0 {
            return Err(AppError::Config(
                "Embedding dimension must be greater than zero".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 || self.embedding.concurrency == 0 {
            return Err(AppError::Config(
                "Embedding batch_size and concurrency must be greater than zero".to_string(),
            ));
        }

        validate_url("chroma.url", &self.chroma.url)?;
        validate_url("milvus.uri", &self.milvus.uri)?;
        if !MILVUS_METRICS.contains(&self.milvus.metric_type.to_ascii_uppercase().as_str()) {
            return Err(AppError::Config(format!(
                "Unknown milvus.metric_type: {}. Supported: {}",
                self.milvus.metric_type,
                MILVUS_METRICS.join(", ")
            )));
        }
        if let Some(ref base_url) = self.embedding.base_url {
            validate_url("embedding.base_url", base_url)?;
        }

        if let Some(ref reranker) = self.reranker {
            if !KNOWN_RERANK_PROVIDERS.contains(&reranker.provider.as_str()) {
                return Err(AppError::Config(format!(
                    "Unknown rerank provider: {}. Supported: {}",
                    reranker.provider,
                    KNOWN_RERANK_PROVIDERS.join(", ")
                )));
            }
            if let Some(ref base_url) = reranker.base_url {
                validate_url("reranker.base_url", base_url)?;
            }
        }

        if self.url_fetch.max_download_size == 0 {
            return Err(AppError::Config(
                "url_fetch.max_download_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_url(field: &str, value: &str) -> AppResult<()> {
    Url::parse(value)
        .map(|_| ())
        .map_err(|e| AppError::Config(format!("Invalid URL for {}: {} ({})", field, value, e)))
}
