//! Deterministic in-process embedding provider
//!
//! Feature-hashing embedder: words and character 3-grams are hashed into a
//! fixed number of buckets and the result is L2-normalized. No model files,
//! no network, stable across restarts, which makes it the default for
//! development and the only provider exercised by the test suite. Shared
//! tokens produce proportionally similar vectors, so relative ranking is
//! meaningful even though absolute quality is far below a real model.

use crate::core::error::Result;
use crate::providers::EmbeddingProvider;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Weight of a whole-word feature relative to a 3-gram feature
const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.4;

/// Local feature-hashing embedding provider
pub struct LocalEmbeddingProvider {
    model: String,
    dimensions: usize,
}

impl LocalEmbeddingProvider {
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model: model.into(),
            dimensions,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in tokenize(text) {
            self.bump(&mut vector, &word, WORD_WEIGHT);

            let chars: Vec<char> = word.chars().collect();
            if chars.len() > 3 {
                for gram in chars.windows(3) {
                    let gram: String = gram.iter().collect();
                    self.bump(&mut vector, &gram, TRIGRAM_WEIGHT);
                }
            }
        }

        l2_normalize(&mut vector);
        vector
    }

    fn bump(&self, vector: &mut [f32], feature: &str, weight: f32) {
        // Stable across processes: bucket and sign come from a content hash,
        // never from the process-seeded std hasher.
        let digest = Sha256::digest(feature.as_bytes());
        let bucket =
            u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes")) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket % self.dimensions] += sign * weight;
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let provider = LocalEmbeddingProvider::new("test", 64);
        let a = provider
            .embed_batch(&["Use PostgreSQL for storage".to_string()])
            .await
            .unwrap();
        let b = provider
            .embed_batch(&["Use PostgreSQL for storage".to_string()])
            .await
            .unwrap();
        assert_eq!(a, b);

        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similarity_orders_by_overlap() {
        let provider = LocalEmbeddingProvider::new("test", 128);
        let texts = vec![
            "connection pool exhausted under load".to_string(),
            "database connection pool exhausted".to_string(),
            "completely unrelated haiku about autumn".to_string(),
        ];
        let vectors = provider.embed_batch(&texts).await.unwrap();
        let related = cosine(&vectors[0], &vectors[1]);
        let unrelated = cosine(&vectors[0], &vectors[2]);
        assert!(related > unrelated);
        assert!(related > 0.3);
    }

    #[tokio::test]
    async fn test_ordering_preserved() {
        let provider = LocalEmbeddingProvider::new("test", 32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let vectors = provider.embed_batch(&texts).await.unwrap();
        let alpha = provider.embed_batch(&texts[0..1]).await.unwrap();
        assert_eq!(vectors[0], alpha[0]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let provider = LocalEmbeddingProvider::new("test", 32);
        let vectors = provider.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
