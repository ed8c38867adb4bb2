//! In-memory vector index
//!
//! Brute-force cosine search over process-local collections. Used for
//! development and tests; the `set_offline` toggle simulates an index
//! outage so degraded-mode behavior can be exercised end to end.

use crate::core::error::{Error, Result};
use crate::core::types::{ScoredPoint, SearchFilter};
use crate::providers::vector_store::{clamped_cosine, payload_matches};
use crate::providers::{VectorIndexProvider, VectorPayload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

struct Collection {
    dimensions: usize,
    points: HashMap<String, (Vec<f32>, VectorPayload)>,
}

/// In-memory vector index provider
#[derive(Clone)]
pub struct InMemoryVectorIndex {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an index outage; all operations fail with
    /// `vector-unavailable` until re-enabled
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::vector_unavailable("index offline"))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndexProvider for InMemoryVectorIndex {
    async fn ensure_collection(&self, name: &str, dimensions: usize) -> Result<()> {
        self.check_online()?;
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            if existing.dimensions != dimensions {
                return Err(Error::VectorSchemaMismatch {
                    message: format!(
                        "collection '{name}' has dimension {}, requested {dimensions}",
                        existing.dimensions
                    ),
                });
            }
            return Ok(());
        }
        collections.insert(
            name.to_string(),
            Collection {
                dimensions,
                points: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: VectorPayload,
    ) -> Result<()> {
        self.check_online()?;
        let mut collections = self.collections.write().await;
        let data = collections
            .get_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection '{collection}'")))?;
        data.points
            .insert(id.to_string(), (vector.to_vec(), payload));
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        self.check_online()?;
        let collections = self.collections.read().await;
        let data = match collections.get(collection) {
            Some(data) => data,
            None => return Ok(Vec::new()),
        };

        let mut hits: Vec<ScoredPoint> = data
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.map(|f| payload_matches(payload, f)).unwrap_or(true))
            .map(|(id, (vector, payload))| ScoredPoint {
                id: id.clone(),
                score: clamped_cosine(query, vector),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_online()?;
        let mut collections = self.collections.write().await;
        if let Some(data) = collections.get_mut(collection) {
            data.points.remove(id);
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorPayload>> {
        self.check_online()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|data| data.points.get(id))
            .map(|(_, payload)| payload.clone()))
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        self.check_online()?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|data| data.points.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<()> {
        self.check_online()
    }
}
