//! Embedding providers and vector helpers.
//!
//! | `embedding.provider` | Backend |
//! |----------------------|---------|
//! | `disabled` | none; retrieval uses keyword search |
//! | `openai` | OpenAI `POST {url}/embeddings`, key from `OPENAI_API_KEY` |
//! | `ollama` | Ollama `POST {url}/api/embed` |
//! | `local` | fastembed in-process (`all-minilm-l6-v2` by default) |
//!
//! Both HTTP backends go through one request loop that retries 429 and 5xx
//! responses and network errors with exponential backoff (1s, 2s, 4s, ...,
//! capped at 32s) and fails immediately on any other 4xx.
//!
//! Vectors are stored in SQLite as little-endian `f32` BLOBs
//! ([`vec_to_blob`] / [`blob_to_vec`]) and ranked with [`cosine_similarity`].

use anyhow::{anyhow, bail, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Model name and dimensionality of the configured backend.
///
/// Embedding itself goes through [`embed_texts`], which dispatches on the
/// config, so the trait stays object safe.
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

/// Embed `texts` with the configured provider, one vector per text in input
/// order.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    match config.provider.as_str() {
        "openai" => embed_remote(RemoteApi::OpenAi, config, texts).await,
        "ollama" => embed_remote(RemoteApi::Ollama, config, texts).await,
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => embed_local_fastembed(config, texts).await,
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    embed_texts(config, &[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

/// Build the provider named by `config.provider`, checking its required
/// settings up front.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(RemoteProvider::new(RemoteApi::OpenAi, config)?)),
        "ollama" => Ok(Box::new(RemoteProvider::new(RemoteApi::Ollama, config)?)),
        "local" => Ok(Box::new(LocalProvider::new(config))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ HTTP providers ============

/// The wire format a remote provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApi {
    OpenAi,
    Ollama,
}

impl RemoteApi {
    fn label(self) -> &'static str {
        match self {
            RemoteApi::OpenAi => "OpenAI",
            RemoteApi::Ollama => "Ollama",
        }
    }

    fn endpoint(self, config: &EmbeddingConfig) -> String {
        let (default_base, path) = match self {
            RemoteApi::OpenAi => ("https://api.openai.com/v1", "/embeddings"),
            RemoteApi::Ollama => ("http://localhost:11434", "/api/embed"),
        };
        let base = config.url.as_deref().unwrap_or(default_base);
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    fn parse(self, json: &Value) -> Result<Vec<Vec<f32>>> {
        match self {
            RemoteApi::OpenAi => parse_openai_response(json),
            RemoteApi::Ollama => parse_ollama_response(json),
        }
    }
}

/// An OpenAI or Ollama embedding model.
pub struct RemoteProvider {
    api: RemoteApi,
    model: String,
    dims: usize,
}

impl RemoteProvider {
    pub fn new(api: RemoteApi, config: &EmbeddingConfig) -> Result<Self> {
        let label = api.label();
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for {} provider", label))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for {} provider", label))?;
        if api == RemoteApi::OpenAi {
            openai_key()?;
        }
        Ok(Self { api, model, dims })
    }

    pub fn api(&self) -> RemoteApi {
        self.api
    }
}

impl EmbeddingProvider for RemoteProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn openai_key() -> Result<String> {
    dotenv::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn embed_remote(
    api: RemoteApi,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let label = api.label();
    let model = config
        .model
        .as_deref()
        .ok_or_else(|| anyhow!("embedding.model required"))?;
    let bearer = match api {
        RemoteApi::OpenAi => Some(openai_key()?),
        RemoteApi::Ollama => None,
    };
    let url = api.endpoint(config);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    let body = serde_json::json!({ "model": model, "input": texts });

    let mut last_err = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt)).await;
        }

        let mut request = client.post(&url).json(&body);
        if let Some(key) = &bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let json: Value = response.json().await?;
                return api.parse(&json);
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let err = anyhow!("{} embeddings error {}: {}", label, status, text);
                if !is_retryable(status) {
                    return Err(err);
                }
                tracing::warn!(attempt, %status, provider = label, "Embedding request failed, retrying");
                last_err = Some(err);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, provider = label, "Embedding request failed, retrying");
                last_err = Some(anyhow!("{} connection error at {}: {}", label, url, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn json_vector(value: &Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("embedding holds a non-number"))
        })
        .collect()
}

/// `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = data
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .map(|i| i as usize)
                .unwrap_or(position);
            let vector = json_vector(item.get("embedding").unwrap_or(&Value::Null))?;
            Ok((index, vector))
        })
        .collect::<Result<Vec<_>>>()?;

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(json_vector)
        .collect()
}

// ============ Local provider (fastembed) ============

/// In-process sentence-transformer embeddings.
///
/// Models are downloaded from Hugging Face on first use and cached on disk;
/// a loaded model stays in memory for the life of the process.
pub struct LocalProvider {
    model_name: String,
    dims: usize,
}

impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let (model_name, dims) = resolve_local_model(config);
        Self { model_name, dims }
    }
}

impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => M::AllMiniLML6V2,
        "bge-small-en-v1.5" => M::BGESmallENV15,
        "bge-base-en-v1.5" => M::BGEBaseENV15,
        "bge-large-en-v1.5" => M::BGELargeENV15,
        "nomic-embed-text-v1" => M::NomicEmbedTextV1,
        "nomic-embed-text-v1.5" => M::NomicEmbedTextV15,
        other => bail!(
            "Unknown local embedding model '{}'; expected one of all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1, \
             nomic-embed-text-v1.5",
            other
        ),
    })
}

#[cfg(feature = "local-embeddings-fastembed")]
static LOCAL_MODELS: once_cell::sync::Lazy<
    std::sync::Mutex<std::collections::HashMap<String, fastembed::TextEmbedding>>,
> = once_cell::sync::Lazy::new(Default::default);

#[cfg(feature = "local-embeddings-fastembed")]
async fn embed_local_fastembed(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let (model_name, _) = resolve_local_model(config);
    let model_kind = fastembed_model(&model_name)?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    // fastembed is synchronous and CPU bound.
    tokio::task::spawn_blocking(move || {
        let mut models = LOCAL_MODELS
            .lock()
            .map_err(|_| anyhow!("Local embedding model lock poisoned"))?;

        let model = match models.entry(model_name) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                tracing::info!(model = %slot.key(), "Loading local embedding model");
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model_kind).with_show_download_progress(true),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                slot.insert(loaded)
            }
        };

        model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow!("Local embedding failed: {}", e))
    })
    .await?
}

// ============ Vector helpers ============

/// Encode a vector as little-endian `f32` bytes.
///
/// ```rust
/// use support_bot::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, mismatched or
/// zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{mock_ollama, ollama_config, term_vector};
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_similarity() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_openai_response_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_openai_response(&serde_json::json!({"data": [{"embedding": "x"}]})).is_err());
    }

    #[test]
    fn test_endpoints_and_backoff() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(RemoteApi::Ollama.endpoint(&config), "http://localhost:11434/api/embed");
        config.url = Some("http://mock:1/v1/".to_string());
        assert_eq!(RemoteApi::OpenAi.endpoint(&config), "http://mock:1/v1/embeddings");
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(20), Duration::from_secs(32));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_provider_requirements() {
        let local = create_provider(&EmbeddingConfig {
            provider: "local".to_string(),
            ..EmbeddingConfig::default()
        })
        .unwrap();
        assert_eq!(local.model_name(), "all-minilm-l6-v2");
        assert_eq!(local.dims(), 384);

        let no_dims = EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&no_dims).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_refuses() {
        let err = embed_query(&EmbeddingConfig::default(), "hello").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_ollama_embeds_in_input_order() {
        let server = mock_ollama(None).await;
        let config = ollama_config(&server);
        let texts = vec!["Autopool staking".to_string(), "governance".to_string()];
        let vectors = embed_texts(&config, &texts).await.unwrap();
        assert_eq!(vectors, vec![term_vector(&texts[0]), term_vector(&texts[1])]);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .expect(1)
            .mount(&server)
            .await;
        let config = EmbeddingConfig { max_retries: 3, ..ollama_config(&server) };

        let err = embed_query(&config, "hello").await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"embeddings": [[0.5, 0.5]]})),
            )
            .mount(&server)
            .await;
        let config = EmbeddingConfig { max_retries: 1, ..ollama_config(&server) };

        assert_eq!(embed_query(&config, "hello").await.unwrap(), vec![0.5, 0.5]);
    }
}
