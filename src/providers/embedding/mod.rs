//! Embedding provider implementations

mod local;
mod ollama;

pub use local::LocalEmbeddingProvider;
pub use ollama::OllamaEmbeddingProvider;
