//! Provider interfaces for the embedding model and the vector index
//!
//! The embedding model library and the external vector index are external
//! collaborators; these traits are the seams the rest of the server programs
//! against. Each concern ships one HTTP-backed implementation and one
//! in-process implementation for development and tests.

use crate::core::error::Result;
use crate::core::types::{ScoredPoint, SearchFilter};
use async_trait::async_trait;

pub mod embedding;
pub mod vector_store;

pub use embedding::{LocalEmbeddingProvider, OllamaEmbeddingProvider};
pub use vector_store::{InMemoryVectorIndex, QdrantVectorIndex};

/// Opaque payload stored next to a vector, used for filtering
pub type VectorPayload = serde_json::Map<String, serde_json::Value>;

/// Text-to-vector contract
///
/// `embed_batch` preserves input ordering. Implementations may serialize
/// internally; callers may invoke concurrently.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
    fn provider_name(&self) -> &'static str;

    async fn health_check(&self) -> Result<()> {
        self.embed_batch(&["health check".to_string()]).await?;
        Ok(())
    }
}

/// Durable named collection of (id, vector, payload)
///
/// Scores returned by `search` are similarities in [0, 1], descending, with
/// ties broken by id. Network failures surface as `vector-unavailable`;
/// callers treat that as a degraded-mode signal, never as fatal.
#[async_trait]
pub trait VectorIndexProvider: Send + Sync {
    /// Idempotent; an existing collection with a different dimension fails
    /// with `vector-schema-mismatch`
    async fn ensure_collection(&self, name: &str, dimensions: usize) -> Result<()>;

    /// Create or replace the point for `id`
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: VectorPayload,
    ) -> Result<()>;

    /// Filter clauses the backend cannot express are applied post-hoc by the
    /// caller; `updated_after` is always the caller's job
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Idempotent
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorPayload>>;

    /// All point ids in the collection, used by the startup orphan sweep
    async fn list_ids(&self, collection: &str) -> Result<Vec<String>>;

    fn provider_name(&self) -> &'static str;

    async fn health_check(&self) -> Result<()>;
}
