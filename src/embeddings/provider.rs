//! HTTP embedding provider implementation
//!
//! Implements `EmbeddingProvider` using any OpenAI-compatible `/v1/embeddings` endpoint.
//!
//! Supported providers:
//! - **Ollama** (default): `http://localhost:11434/v1/embeddings` with `nomic-embed-text`
//! - **OpenAI**: `https://api.openai.com/v1/embeddings` with `text-embedding-3-small`
//! - **LiteLLM / vLLM / any OpenAI-compatible**: just set the URL
//!
//! Configured through [`EmbeddingsConfig`](crate::EmbeddingsConfig), which reads
//! `EMBEDDING_URL`, `EMBEDDING_MODEL`, `EMBEDDING_API_KEY` and
//! `EMBEDDING_DIMENSIONS`.

use super::traits::EmbeddingProvider;
use crate::EmbeddingsConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP-based embedding provider using the OpenAI `/v1/embeddings` API format.
///
/// Thread-safe and cheaply cloneable (shares the reqwest client internally).
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
    batch_size: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: EmbeddingInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum EmbeddingInput<'a> {
    Single(&'a str),
    Batch(&'a [String]),
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl HttpEmbeddingProvider {
    /// Create a provider with explicit configuration.
    ///
    /// `dimensions` must match the model output; responses of another size
    /// are rejected.
    pub fn new(
        url: String,
        model: String,
        api_key: Option<String>,
        dimensions: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url,
            model,
            api_key,
            dimensions,
            batch_size: batch_size.max(1),
        })
    }

    /// Build a provider from configuration. Returns `None` when the URL is
    /// empty or `disabled`, which restricts search to lexical mode.
    pub fn from_config(config: &EmbeddingsConfig) -> Result<Option<Self>> {
        if !config.is_enabled() {
            return Ok(None);
        }
        Self::new(
            config.url.clone(),
            config.model.clone(),
            config.api_key.clone().filter(|k| !k.is_empty()),
            config.dimensions,
            config.batch_size,
        )
        .map(Some)
    }

    async fn request_embeddings(&self, input: EmbeddingInput<'_>) -> Result<Vec<Vec<f32>>> {
        let expected = match &input {
            EmbeddingInput::Single(_) => 1,
            EmbeddingInput::Batch(texts) => texts.len(),
        };
        let body = EmbeddingRequest {
            model: &self.model,
            input,
        };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("Failed to connect to embedding API at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(ErrorResponse {
                error: Some(detail),
            }) = serde_json::from_str::<ErrorResponse>(&body)
            {
                anyhow::bail!(
                    "Embedding API error ({}): {}",
                    status.as_u16(),
                    detail.message
                );
            }
            anyhow::bail!("Embedding API returned {}: {}", status.as_u16(), body);
        }

        let resp: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding API response")?;

        let mut data = resp.data;
        data.sort_by_key(|d| d.index);

        if data.len() != expected {
            anyhow::bail!(
                "Embedding API returned {} vectors for {} inputs",
                data.len(),
                expected
            );
        }

        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        for (i, emb) in embeddings.iter().enumerate() {
            if emb.len() != self.dimensions {
                anyhow::bail!(
                    "Embedding dimension mismatch at index {}: expected {}, got {} (model: {})",
                    i,
                    self.dimensions,
                    emb.len(),
                    self.model
                );
            }
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.request_embeddings(EmbeddingInput::Single(text))
            .await?
            .into_iter()
            .next()
            .context("Embedding API returned empty response")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let mut embeddings = self.request_embeddings(EmbeddingInput::Batch(chunk)).await?;
            all_embeddings.append(&mut embeddings);
        }
        Ok(all_embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, dims: usize, batch: usize) -> HttpEmbeddingProvider {
        HttpEmbeddingProvider::new(
            format!("{}/v1/embeddings", server.uri()),
            "test-model".to_string(),
            Some("sk-test".to_string()),
            dims,
            batch,
        )
        .unwrap()
    }

    #[test]
    fn test_from_config_disabled() {
        let mut config = EmbeddingsConfig::default();
        config.url = "disabled".into();
        assert!(HttpEmbeddingProvider::from_config(&config).unwrap().is_none());
        config.url = String::new();
        assert!(HttpEmbeddingProvider::from_config(&config).unwrap().is_none());

        config.url = "http://localhost:8080/embed".into();
        config.dimensions = 512;
        let provider = HttpEmbeddingProvider::from_config(&config).unwrap().unwrap();
        assert_eq!(provider.dimensions(), 512);
        assert_eq!(provider.model_name(), config.model);
    }

    #[tokio::test]
    async fn test_embed_text_sends_bearer_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}],
                "model": "test-model"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let v = provider(&server, 3, 8).embed_text("hello").await.unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_embed_batch_reorders_and_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"embedding": [2.0, 2.0], "index": 1},
                    {"embedding": [1.0, 1.0], "index": 0}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let texts: Vec<String> = (0..4).map(|i| format!("t{}", i)).collect();
        let out = provider(&server, 2, 2).embed_batch(&texts).await.unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], vec![1.0, 1.0]);
        assert_eq!(out[1], vec![2.0, 2.0]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1], "index": 0}]
            })))
            .mount(&server)
            .await;

        let err = provider(&server, 3, 8).embed_text("x").await.unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[tokio::test]
    async fn test_api_error_message_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "rate limited", "type": "requests"}
            })))
            .mount(&server)
            .await;

        let err = provider(&server, 3, 8).embed_text("x").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("429"));
        assert!(msg.contains("rate limited"));
    }
}
