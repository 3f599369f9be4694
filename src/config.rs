//! TOML configuration and environment secrets.
//!
//! The config file describes where things live (database, scraped data),
//! how they are processed (chunking, indexing, retrieval) and which
//! endpoints are used (LLM providers, scraped sites, HTTP bind address).
//! Tokens and API keys never live in the file: they are read from the
//! environment (a `.env` file is honoured) into [`Secrets`].
//!
//! Every section except `[db]` is optional and falls back to defaults that
//! target the Auto Finance deployment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Tokens and API keys, filled from the environment by [`load_config`].
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_words: default_overlap_words(),
        }
    }
}

fn default_max_chars() -> usize {
    800
}
fn default_overlap_words() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Collection rebuilt by `index build` and queried by the agent.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Collections queried when the primary one does not exist yet.
    #[serde(default = "default_fallback_collections")]
    pub fallback_collections: Vec<String>,
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            fallback_collections: default_fallback_collections(),
            batch_size: default_index_batch_size(),
        }
    }
}

fn default_collection() -> String {
    "auto_finance_complete".to_string()
}
fn default_fallback_collections() -> Vec<String> {
    vec!["auto_finance_docs".to_string()]
}
fn default_index_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_n_results")]
    pub n_results: usize,
    #[serde(default = "default_true")]
    pub prioritize_sources: bool,
    /// Candidates fetched per requested result before priority sorting.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            n_results: default_n_results(),
            prioritize_sources: true,
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_n_results() -> usize {
    8
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the OpenAI or Ollama provider.
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
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature sent to OpenAI models.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_model")]
    pub summary_model: String,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default = "default_anthropic_url")]
    pub anthropic_url: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            summary_model: default_model(),
            summary_max_tokens: default_summary_max_tokens(),
            anthropic_url: default_anthropic_url(),
            anthropic_version: default_anthropic_version(),
            openai_url: default_openai_url(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.3
}
fn default_summary_max_tokens() -> u32 {
    300
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_llm_max_retries() -> u32 {
    2
}

/// Behaviour shared by every platform adapter.
#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    /// Product name used in prompts and help texts.
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Optional JSON file of named system prompts.
    #[serde(default)]
    pub prompts_file: Option<PathBuf>,
    #[serde(default = "default_bot_n_results")]
    pub n_results: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i64,
    /// Default model for bots registered without one.
    #[serde(default = "default_bot_model")]
    pub default_model: String,
    /// Restart running bots after the scraper service rebuilds the index.
    #[serde(default)]
    pub restart_on_index_update: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            prompts_file: None,
            n_results: default_bot_n_results(),
            max_messages: default_max_messages(),
            timeout_minutes: default_timeout_minutes(),
            default_model: default_bot_model(),
            restart_on_index_update: false,
        }
    }
}

fn default_project_name() -> String {
    "Auto Finance".to_string()
}
fn default_bot_n_results() -> usize {
    10
}
fn default_max_messages() -> usize {
    10
}
fn default_timeout_minutes() -> i64 {
    30
}
fn default_bot_model() -> String {
    "gpt-4o".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScraperConfig {
    /// Root directory for scraped JSON and markdown output.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub save_markdown: bool,
    #[serde(default)]
    pub docs: DocsScraperConfig,
    #[serde(default)]
    pub website: WebsiteScraperConfig,
    #[serde(default)]
    pub blog: BlogScraperConfig,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            interval_minutes: default_interval_minutes(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            save_markdown: true,
            docs: DocsScraperConfig::default(),
            website: WebsiteScraperConfig::default(),
            blog: BlogScraperConfig::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./scraped_data")
}
fn default_interval_minutes() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; support-bot/0.3; +https://auto.finance)".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocsScraperConfig {
    #[serde(default = "default_docs_url")]
    pub base_url: String,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default = "default_docs_delay_ms")]
    pub delay_ms: u64,
}

impl Default for DocsScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_docs_url(),
            max_pages: None,
            delay_ms: default_docs_delay_ms(),
        }
    }
}

fn default_docs_url() -> String {
    "https://docs.auto.finance/".to_string()
}
fn default_docs_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebsiteScraperConfig {
    #[serde(default = "default_website_url")]
    pub base_url: String,
    #[serde(default = "default_start_paths")]
    pub start_paths: Vec<String>,
    #[serde(default = "default_skip_patterns")]
    pub skip_patterns: Vec<String>,
    #[serde(default = "default_website_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_website_delay_ms")]
    pub delay_ms: u64,
    /// Regexes matched against page text to discover pool names.
    #[serde(default = "default_pool_name_patterns")]
    pub pool_name_patterns: Vec<String>,
}

impl Default for WebsiteScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_website_url(),
            start_paths: default_start_paths(),
            skip_patterns: default_skip_patterns(),
            max_pages: default_website_max_pages(),
            delay_ms: default_website_delay_ms(),
            pool_name_patterns: default_pool_name_patterns(),
        }
    }
}

fn default_website_url() -> String {
    "https://app.auto.finance".to_string()
}
fn default_start_paths() -> Vec<String> {
    ["", "/pools", "/stoke", "/tokelp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_skip_patterns() -> Vec<String> {
    vec!["/portfolio".to_string()]
}
fn default_website_max_pages() -> usize {
    50
}
fn default_website_delay_ms() -> u64 {
    2500
}
fn default_pool_name_patterns() -> Vec<String> {
    ["auto", "base", "plasma", "arb", "silo", "dinero", "sonic", "bal"]
        .iter()
        .map(|p| format!(r"\b({}[A-Z]+)\b", p))
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlogScraperConfig {
    #[serde(default = "default_blog_url")]
    pub base_url: String,
    #[serde(default)]
    pub max_posts: Option<usize>,
    #[serde(default = "default_docs_delay_ms")]
    pub delay_ms: u64,
}

impl Default for BlogScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_blog_url(),
            max_posts: None,
            delay_ms: default_docs_delay_ms(),
        }
    }
}

fn default_blog_url() -> String {
    "https://blog.tokemak.xyz".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Endpoint used to verify Google ID tokens.
    #[serde(default = "default_google_tokeninfo_url")]
    pub google_tokeninfo_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            google_tokeninfo_url: default_google_tokeninfo_url(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_google_tokeninfo_url() -> String {
    "https://oauth2.googleapis.com/tokeninfo".to_string()
}

/// Credentials read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub discord_bot_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,
    pub google_client_id: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: env_var("ANTHROPIC_API_KEY"),
            openai_api_key: env_var("OPENAI_API_KEY"),
            telegram_bot_token: env_var("TELEGRAM_BOT_TOKEN"),
            discord_bot_token: env_var("DISCORD_BOT_TOKEN"),
            slack_bot_token: env_var("SLACK_BOT_TOKEN"),
            slack_app_token: env_var("SLACK_APP_TOKEN"),
            google_client_id: env_var("GOOGLE_CLIENT_ID"),
        }
    }
}

/// Reads an environment variable, treating empty values as unset.
fn env_var(name: &str) -> Option<String> {
    dotenv::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// A config with every default and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            bot: BotConfig::default(),
            scraper: ScraperConfig::default(),
            server: ServerConfig::default(),
            secrets: Secrets::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.secrets = Secrets::from_env();
    if let Some(model) = env_var("BOT_MODEL") {
        config.llm.model = model;
    }
    if let Some(max_tokens) = env_var("BOT_MAX_TOKENS") {
        config.llm.max_tokens = max_tokens
            .parse()
            .with_context(|| format!("BOT_MAX_TOKENS is not a number: {}", max_tokens))?;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.index.batch_size == 0 {
        anyhow::bail!("index.batch_size must be > 0");
    }
    if config.index.collection.trim().is_empty() {
        anyhow::bail!("index.collection must not be empty");
    }

    if config.retrieval.n_results < 1 {
        anyhow::bail!("retrieval.n_results must be >= 1");
    }
    if config.retrieval.candidate_multiplier < 1 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }

    if config.llm.max_tokens == 0 {
        anyhow::bail!("llm.max_tokens must be > 0");
    }

    // Summaries keep the last 3 messages, so fewer would summarise nothing.
    if config.bot.max_messages < 3 {
        anyhow::bail!("bot.max_messages must be >= 3");
    }
    if config.bot.timeout_minutes < 1 {
        anyhow::bail!("bot.timeout_minutes must be >= 1");
    }

    if config.scraper.interval_minutes < 1 {
        anyhow::bail!("scraper.interval_minutes must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config("[db]\npath = \"./data/bot.sqlite\"\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chunking.max_chars, 800);
        assert_eq!(config.chunking.overlap_words, 100);
        assert_eq!(config.index.batch_size, 100);
        assert_eq!(config.index.collection, "auto_finance_complete");
        assert_eq!(config.retrieval.n_results, 8);
        assert_eq!(config.bot.max_messages, 10);
        assert_eq!(config.scraper.interval_minutes, 10);
        assert_eq!(config.scraper.website.start_paths.len(), 4);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let file = write_config("[db]\npath = \"x.sqlite\"\n[chunking]\nmax_chars = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("chunking.max_chars"));
    }

    #[test]
    fn test_rejects_unknown_embedding_provider() {
        let file = write_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"magic\"\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_openai_embeddings_require_dims() {
        let file = write_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_config(Path::new("/nonexistent/support.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/support.toml"));
    }

    #[test]
    fn test_default_pool_patterns_compile() {
        for pattern in default_pool_name_patterns() {
            regex::Regex::new(&pattern).unwrap();
        }
    }
}
