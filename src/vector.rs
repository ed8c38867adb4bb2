//! Vector store component
//!
//! Binds the configured [`VectorIndexProvider`] to the process-wide
//! collection and tracks degraded mode. When the external index is
//! unreachable at initialization the server still starts: reads return
//! empty results and writes fail with a retryable `vector-unavailable`.
//! The status probe doubles as the recovery path.

use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::core::types::{ScoredPoint, SearchFilter};
use crate::providers::{VectorIndexProvider, VectorPayload};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Collection-scoped vector store with degraded-mode tracking
pub struct VectorStore {
    provider: Arc<dyn VectorIndexProvider>,
    collection: String,
    dimensions: usize,
    degraded: AtomicBool,
}

impl VectorStore {
    pub fn new(
        provider: Arc<dyn VectorIndexProvider>,
        collection: String,
        dimensions: usize,
    ) -> Self {
        Self {
            provider,
            collection,
            dimensions,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the external index was unreachable at the last probe
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn note_result<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(Error::VectorUnavailable { .. }) => {
                self.degraded.store(true, Ordering::SeqCst);
            }
            Ok(_) => {
                self.degraded.store(false, Ordering::SeqCst);
            }
            Err(_) => {}
        }
        result
    }

    pub async fn upsert(&self, id: &str, vector: &[f32], payload: VectorPayload) -> Result<()> {
        let result = self
            .provider
            .upsert(&self.collection, id, vector, payload)
            .await;
        self.note_result(result)
    }

    pub async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        let result = self
            .provider
            .search(&self.collection, query, limit, filter)
            .await;
        self.note_result(result)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = self.provider.delete(&self.collection, id).await;
        self.note_result(result)
    }

    pub async fn get(&self, id: &str) -> Result<Option<VectorPayload>> {
        let result = self.provider.get(&self.collection, id).await;
        self.note_result(result)
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let result = self.provider.list_ids(&self.collection).await;
        self.note_result(result)
    }
}

#[async_trait]
impl Component for VectorStore {
    fn name(&self) -> &'static str {
        "vector-store"
    }

    async fn initialize(&self) -> Result<()> {
        match self
            .provider
            .ensure_collection(&self.collection, self.dimensions)
            .await
        {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                tracing::info!(
                    collection = %self.collection,
                    provider = self.provider.provider_name(),
                    "vector collection ready"
                );
                Ok(())
            }
            Err(Error::VectorUnavailable { message }) => {
                // Degraded start: queries return empty, writes fail retryable.
                self.degraded.store(true, Ordering::SeqCst);
                tracing::warn!(
                    collection = %self.collection,
                    "vector index unreachable at init, starting degraded: {}",
                    message
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn status(&self) -> ComponentStatus {
        if self.is_degraded() {
            // Probe doubles as recovery: a reachable index clears the flag.
            match self
                .provider
                .ensure_collection(&self.collection, self.dimensions)
                .await
            {
                Ok(()) => {
                    self.degraded.store(false, Ordering::SeqCst);
                    tracing::info!(collection = %self.collection, "vector index recovered");
                    ComponentStatus::healthy()
                }
                Err(e) => ComponentStatus::unhealthy(e.to_string()),
            }
        } else {
            match self.provider.health_check().await {
                Ok(()) => ComponentStatus::healthy(),
                Err(e) => {
                    self.degraded.store(true, Ordering::SeqCst);
                    ComponentStatus::unhealthy(e.to_string())
                }
            }
        }
    }

    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryVectorIndex;

    #[tokio::test]
    async fn test_degraded_start_then_recovery() {
        let index = Arc::new(InMemoryVectorIndex::new());
        index.set_offline(true);
        let store = VectorStore::new(index.clone(), "test".to_string(), 4);

        // Unreachable index must not fail initialization.
        store.initialize().await.unwrap();
        assert!(store.is_degraded());

        index.set_offline(false);
        let status = store.status().await;
        assert!(matches!(
            status.health,
            crate::core::component::ComponentHealth::Healthy
        ));
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_failures_mark_degraded() {
        let index = Arc::new(InMemoryVectorIndex::new());
        let store = VectorStore::new(index.clone(), "test".to_string(), 4);
        store.initialize().await.unwrap();
        assert!(!store.is_degraded());

        index.set_offline(true);
        let err = store
            .upsert("a", &[0.0; 4], Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "vector-unavailable");
        assert!(store.is_degraded());
    }
}
