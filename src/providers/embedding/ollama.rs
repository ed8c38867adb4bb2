//! Ollama embedding provider implementation

use crate::core::error::{Error, Result};
use crate::providers::EmbeddingProvider;
use async_trait::async_trait;
use std::time::Duration;

/// Ollama embedding provider
///
/// The Ollama embeddings API takes one prompt per request, so a batch fans
/// out into sequential calls; batching for throughput happens a level above.
pub struct OllamaEmbeddingProvider {
    base_url: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

impl OllamaEmbeddingProvider {
    pub fn new(base_url: String, model: String, dimensions: usize) -> Result<Self> {
        Self::with_timeout(base_url, model, dimensions, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: String,
        model: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::embedder_unavailable(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            base_url,
            model,
            dimensions,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": text,
            "stream": false,
        });

        let response = self
            .client
            .post(format!(
                "{}/api/embeddings",
                self.base_url.trim_end_matches('/')
            ))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::embedder_unavailable("embedding request timed out")
                } else {
                    Error::embedder_unavailable(format!("embedding request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::embedder_unavailable(format!(
                "Ollama API error {status}: {body}"
            )));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::embedder_unavailable(format!("malformed response: {e}")))?;

        let vector: Vec<f32> = data["embedding"]
            .as_array()
            .ok_or_else(|| Error::embedder_unavailable("response missing embedding array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vector.len() != self.dimensions {
            return Err(Error::embedder_unavailable(format!(
                "model returned {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            )));
        }

        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed_one(text).await?);
        }
        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embed_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embedding": [0.1, 0.2, 0.3]}"#)
            .expect(1)
            .create_async()
            .await;

        let provider =
            OllamaEmbeddingProvider::new(server.url(), "all-minilm".to_string(), 3).unwrap();
        let vectors = provider
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0], vec![0.1, 0.2, 0.3]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_maps_to_embedder_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/embeddings")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let provider =
            OllamaEmbeddingProvider::new(server.url(), "all-minilm".to_string(), 3).unwrap();
        let err = provider
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "embedder-unavailable");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/embeddings")
            .with_status(200)
            .with_body(r#"{"embedding": [0.1, 0.2]}"#)
            .create_async()
            .await;

        let provider =
            OllamaEmbeddingProvider::new(server.url(), "all-minilm".to_string(), 3).unwrap();
        let err = provider
            .embed_batch(&["hello".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "embedder-unavailable");
    }
}
