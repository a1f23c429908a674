//! Embedding backend contract and the HTTP implementation

use crate::config::HttpBackendConfig;
use crate::error::{EmbedError, ItemFailure, Result};
use async_trait::async_trait;
use half::f16;
use serde::{Deserialize, Serialize};

/// Per-text outcome returned by a backend call.
pub type RawItem = std::result::Result<Vec<f32>, ItemFailure>;

/// Per-text outcome after the gateway has validated and normalized it.
pub type ItemResult = std::result::Result<Vec<f16>, ItemFailure>;

/// Identity of the model behind a backend.
///
/// Vectors from different models (or the same model at a different dimension) are not
/// comparable, so the vector store keys its collections on [`ModelInfo::model_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub dimension: usize,
    /// Whether stored vectors are L2-normalized (the gateway always normalizes)
    pub normalized: bool,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dimension,
            normalized: true,
        }
    }

    /// Stable identifier used to detect model or dimension changes.
    pub fn model_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.name,
            self.version,
            self.dimension,
            if self.normalized { "norm" } else { "raw" }
        )
    }
}

/// Result of embedding a batch of texts through the gateway
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// One entry per input text, in input order
    pub items: Vec<ItemResult>,
    /// The dimension of each successful vector
    pub dimension: usize,
}

impl EmbeddingResult {
    pub fn new(items: Vec<ItemResult>, dimension: usize) -> Self {
        Self { items, dimension }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of texts that produced a vector
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok()).count()
    }
}

/// Anything that turns text into fixed-length vectors.
///
/// One `embed_batch` call is one round trip to the backend. Failures that concern a
/// single text are reported in place; failures of the call itself are returned as `Err`
/// and classified by [`EmbedError::is_transient`].
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<RawItem>>;

    fn model(&self) -> &ModelInfo;

    fn backend_name(&self) -> &str;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Backend for a local Ollama-compatible service (`POST /api/embed`).
#[derive(Clone)]
pub struct HttpEmbeddingBackend {
    client: reqwest::Client,
    endpoint: String,
    config: HttpBackendConfig,
    model: ModelInfo,
}

impl std::fmt::Debug for HttpEmbeddingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingBackend")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

impl HttpEmbeddingBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let endpoint = format!("{}/api/embed", config.base_url.trim_end_matches('/'));
        let model = ModelInfo::new(&config.model, &config.model_version, config.dimension);

        Ok(Self {
            client,
            endpoint,
            config,
            model,
        })
    }

    fn check_item(&self, embedding: Vec<f32>) -> RawItem {
        if embedding.is_empty() {
            Err(ItemFailure::Empty)
        } else if embedding.len() != self.config.dimension {
            Err(ItemFailure::Dimension {
                expected: self.config.dimension,
                actual: embedding.len(),
            })
        } else {
            Ok(embedding)
        }
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<RawItem>> {
        tracing::debug!(
            "Requesting {} embeddings from {}",
            texts.len(),
            self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.config.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::MalformedInput { message });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbedResponse = response.json().await?;
        if body.embeddings.len() != texts.len() {
            return Err(EmbedError::protocol(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                body.embeddings.len()
            )));
        }

        Ok(body
            .embeddings
            .into_iter()
            .map(|embedding| self.check_item(embedding))
            .collect())
    }

    fn model(&self) -> &ModelInfo {
        &self.model
    }

    fn backend_name(&self) -> &str {
        "ollama-http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_changes_with_dimension() {
        let a = ModelInfo::new("nomic-embed-text", "v1.5", 768);
        let b = ModelInfo::new("nomic-embed-text", "v1.5", 512);

        assert_eq!(a.model_id(), "nomic-embed-text:v1.5:768:norm");
        assert_ne!(a.model_id(), b.model_id());
    }

    #[test]
    fn test_http_backend_endpoint_and_item_checks() {
        let backend = HttpEmbeddingBackend::new(HttpBackendConfig {
            base_url: "http://localhost:11434/".to_string(),
            dimension: 3,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(backend.endpoint, "http://localhost:11434/api/embed");
        assert_eq!(backend.model().dimension, 3);
        assert_eq!(backend.check_item(vec![]), Err(ItemFailure::Empty));
        assert_eq!(
            backend.check_item(vec![1.0, 2.0]),
            Err(ItemFailure::Dimension {
                expected: 3,
                actual: 2
            })
        );
        assert!(backend.check_item(vec![1.0, 2.0, 3.0]).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        // Port 9 (discard) is essentially never listening on loopback
        let backend = HttpEmbeddingBackend::new(HttpBackendConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            dimension: 3,
            request_timeout_ms: 2_000,
            ..Default::default()
        })
        .unwrap();

        let err = backend
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err:?}");
    }

    #[test]
    fn test_embedding_result_counts() {
        let result = EmbeddingResult::new(
            vec![Ok(vec![f16::from_f32(1.0)]), Err(ItemFailure::Empty)],
            1,
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result.succeeded(), 1);
        assert!(!result.is_empty());
    }
}
