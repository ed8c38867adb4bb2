//! Knowledge base component
//!
//! Orchestrates the embed-then-upsert pipeline and the typed retrieval
//! surface. Sidecar records on local disk are the authoritative metadata;
//! vectors live in the vector store and are referenced by id. A pattern
//! becomes visible only after its vector upsert succeeds; on failure the
//! sidecar write is rolled back.

mod sidecar;

pub use sidecar::SidecarStore;

use crate::cache::TieredCache;
use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::core::types::{Pattern, SearchFilter, SearchHit};
use crate::embedder::Embedder;
use crate::providers::VectorPayload;
use crate::vector::VectorStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Mutable fields accepted by [`KnowledgeBase::update`]
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PatternUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub tags: Option<Vec<String>>,
    pub language: Option<String>,
}

/// Search result set plus whether it was served from cache
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub cache_hit: bool,
}

/// Vector-backed store of typed patterns
pub struct KnowledgeBase {
    embedder: Arc<Embedder>,
    vectors: Arc<VectorStore>,
    cache: Arc<TieredCache>,
    sidecars: SidecarStore,
    model: String,
}

impl KnowledgeBase {
    pub fn new(
        embedder: Arc<Embedder>,
        vectors: Arc<VectorStore>,
        cache: Arc<TieredCache>,
        sidecar_dir: std::path::PathBuf,
        model: String,
    ) -> Self {
        Self {
            embedder,
            vectors,
            cache,
            sidecars: SidecarStore::new(sidecar_dir),
            model,
        }
    }

    /// Index a pattern: assign an id if absent, embed `title + body`, upsert
    /// the vector and persist the sidecar. Returns the assigned id.
    pub async fn index(&self, mut pattern: Pattern) -> Result<String> {
        if pattern.id.is_empty() {
            pattern.id = uuid::Uuid::new_v4().to_string();
        }
        pattern.updated_at = chrono::Utc::now();

        self.sidecars.write(&pattern)?;

        match self.embed_and_upsert(&pattern).await {
            Ok(()) => {
                self.invalidate_queries(&pattern);
                tracing::debug!(id = %pattern.id, kind = %pattern.kind, "pattern indexed");
                Ok(pattern.id)
            }
            Err(e) => {
                // Roll back so the pattern is never visible half-indexed.
                if let Err(cleanup) = self.sidecars.remove(&pattern.id) {
                    tracing::warn!(id = %pattern.id, "sidecar rollback failed: {}", cleanup);
                }
                match e {
                    retryable @ (Error::VectorUnavailable { .. }
                    | Error::EmbedderUnavailable { .. }) => Err(retryable),
                    other => Err(Error::index_failed(other.to_string())),
                }
            }
        }
    }

    async fn embed_and_upsert(&self, pattern: &Pattern) -> Result<()> {
        let vector = self.embed_cached(&pattern.embedding_text()).await?;
        self.vectors
            .upsert(&pattern.id, &vector, payload_for(pattern))
            .await
    }

    /// Embed with the `hash(model, text)` cache in front of the provider
    async fn embed_cached(&self, text: &str) -> Result<Vec<f32>> {
        let key = embedding_cache_key(&self.model, text);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(vector) = serde_json::from_slice::<Vec<f32>>(&cached) {
                return Ok(vector);
            }
        }

        let vector = self.embedder.embed_one(text).await?;
        if let Ok(bytes) = serde_json::to_vec(&vector) {
            self.cache.set(&key, bytes, None);
        }
        Ok(vector)
    }

    /// Read a pattern's sidecar record
    pub fn get(&self, id: &str) -> Result<Option<Pattern>> {
        self.sidecars.read(id)
    }

    /// Merge mutable fields, refresh the vector payload and rewrite the
    /// sidecar
    pub async fn update(&self, id: &str, update: PatternUpdate) -> Result<Pattern> {
        let mut pattern = self
            .sidecars
            .read(id)?
            .ok_or_else(|| Error::not_found(format!("pattern {id}")))?;

        if let Some(title) = update.title {
            pattern.title = title;
        }
        if let Some(body) = update.body {
            pattern.body = body;
        }
        if let Some(tags) = update.tags {
            pattern.tags = tags;
        }
        if let Some(language) = update.language {
            pattern.language = Some(language);
        }
        pattern.updated_at = chrono::Utc::now();

        // Unchanged text resolves from the embedding cache, so a
        // metadata-only update refreshes the payload without recomputing
        // the vector.
        self.embed_and_upsert(&pattern).await?;
        self.sidecars.write(&pattern)?;
        self.invalidate_queries(&pattern);
        Ok(pattern)
    }

    /// Delete sidecar first, then the vector: a crash in between leaves an
    /// orphan vector for the startup sweep, never a dangling sidecar
    pub async fn delete(&self, id: &str) -> Result<()> {
        let pattern = self
            .sidecars
            .read(id)?
            .ok_or_else(|| Error::not_found(format!("pattern {id}")))?;

        self.sidecars.remove(id)?;
        if let Err(e) = self.vectors.delete(id).await {
            tracing::warn!(id, "vector delete failed, orphan left for sweep: {}", e);
        }
        self.invalidate_queries(&pattern);
        Ok(())
    }

    /// Filtered similarity search over indexed patterns
    ///
    /// A degraded vector index yields an empty result set, not an error.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<SearchOutcome> {
        let cache_key = query_cache_key(query, limit, filter);
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Ok(hits) = serde_json::from_slice::<Vec<SearchHit>>(&cached) {
                return Ok(SearchOutcome {
                    hits,
                    cache_hit: true,
                });
            }
        }

        let query_vector = self.embed_cached(query).await?;

        let points = match self.vectors.search(&query_vector, limit, filter).await {
            Ok(points) => points,
            Err(Error::VectorUnavailable { message }) => {
                tracing::warn!("search degraded, returning empty: {}", message);
                return Ok(SearchOutcome {
                    hits: Vec::new(),
                    cache_hit: false,
                });
            }
            Err(e) => return Err(e),
        };

        let hits = self.hydrate(points, filter)?;
        if let Ok(bytes) = serde_json::to_vec(&hits) {
            self.cache.set(&cache_key, bytes, None);
        }
        Ok(SearchOutcome {
            hits,
            cache_hit: false,
        })
    }

    /// Nearest neighbors of an already-indexed pattern, by its stored vector
    pub async fn similar_to(&self, id: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let pattern = self
            .sidecars
            .read(id)?
            .ok_or_else(|| Error::not_found(format!("pattern {id}")))?;

        // The stored vector equals the embedding of the stored text, so the
        // cached embedding path reproduces it without a second index call.
        let vector = self.embed_cached(&pattern.embedding_text()).await?;
        let points = match self.vectors.search(&vector, limit + 1, None).await {
            Ok(points) => points,
            Err(Error::VectorUnavailable { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut hits = self.hydrate(points, None)?;
        hits.retain(|hit| hit.pattern.id != id);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Hydrate scored points from sidecars, dropping orphans and applying
    /// the clauses the index cannot express
    fn hydrate(
        &self,
        points: Vec<crate::core::types::ScoredPoint>,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::with_capacity(points.len());
        for point in points {
            match self.sidecars.read(&point.id) {
                Ok(Some(pattern)) => {
                    if let Some(after) = filter.and_then(|f| f.updated_after) {
                        if pattern.updated_at <= after {
                            continue;
                        }
                    }
                    hits.push(SearchHit {
                        pattern,
                        score: point.score,
                    });
                }
                Ok(None) => {
                    tracing::debug!(id = %point.id, "dropping orphan vector from results");
                }
                Err(e) => {
                    tracing::warn!(id = %point.id, "sidecar read failed during hydrate: {}", e);
                }
            }
        }
        Ok(hits)
    }

    /// Kind-prefix invalidation: a mutation of kind K clears every query
    /// cache tagged K plus the untagged queries
    fn invalidate_queries(&self, pattern: &Pattern) {
        let kind_prefix = format!("kb:q:{}:", pattern.kind.as_str());
        self.cache.invalidate_prefix(kind_prefix.as_bytes());
        self.cache.invalidate_prefix(b"kb:q:any:");
    }

    /// Reap vectors whose sidecar no longer exists (crash between delete
    /// steps, or a rolled-back index)
    async fn sweep_orphans(&self) -> Result<usize> {
        let vector_ids = match self.vectors.list_ids().await {
            Ok(ids) => ids,
            Err(Error::VectorUnavailable { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };

        let sidecar_ids: std::collections::HashSet<String> =
            self.sidecars.list_ids()?.into_iter().collect();

        let mut reaped = 0;
        for id in vector_ids {
            if !sidecar_ids.contains(&id) {
                if self.vectors.delete(&id).await.is_ok() {
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "startup sweep removed orphan vectors");
        }
        Ok(reaped)
    }

    pub fn sidecars(&self) -> &SidecarStore {
        &self.sidecars
    }
}

fn payload_for(pattern: &Pattern) -> VectorPayload {
    let mut payload = VectorPayload::new();
    payload.insert("kind".to_string(), serde_json::json!(pattern.kind.as_str()));
    payload.insert("tags".to_string(), serde_json::json!(pattern.tags));
    if let Some(language) = &pattern.language {
        payload.insert("language".to_string(), serde_json::json!(language));
    }
    payload.insert(
        "updated_at".to_string(),
        serde_json::json!(pattern.updated_at.to_rfc3339()),
    );
    payload
}

fn embedding_cache_key(model: &str, text: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut key = b"kb:e:".to_vec();
    key.extend(digest.iter().map(|b| format!("{b:02x}")).collect::<String>().into_bytes());
    key
}

fn query_cache_key(query: &str, limit: usize, filter: Option<&SearchFilter>) -> Vec<u8> {
    let kind_tag = filter.map(|f| f.kind_tag()).unwrap_or("any");
    let filter_json = filter
        .map(|f| serde_json::to_string(f).unwrap_or_default())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0]);
    hasher.update(limit.to_le_bytes());
    hasher.update(filter_json.as_bytes());
    let digest = hasher.finalize();

    let mut key = format!("kb:q:{kind_tag}:").into_bytes();
    key.extend(digest.iter().map(|b| format!("{b:02x}")).collect::<String>().into_bytes());
    key
}

#[async_trait]
impl Component for KnowledgeBase {
    fn name(&self) -> &'static str {
        "knowledge-base"
    }

    async fn initialize(&self) -> Result<()> {
        self.sidecars.ensure_dir()?;
        self.sweep_orphans().await?;
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        if self.sidecars.dir().exists() {
            ComponentStatus::healthy()
        } else {
            ComponentStatus::unhealthy("sidecar directory missing")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PatternKind;
    use crate::providers::{InMemoryVectorIndex, LocalEmbeddingProvider};
    use tempfile::TempDir;

    const DIM: usize = 128;

    struct Fixture {
        _tmp: TempDir,
        kb: KnowledgeBase,
        index: Arc<InMemoryVectorIndex>,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(InMemoryVectorIndex::new());
        let embedder = Arc::new(Embedder::new(
            Arc::new(LocalEmbeddingProvider::new("test-model", DIM)),
            DIM,
        ));
        let vectors = Arc::new(VectorStore::new(index.clone(), "kb_test".to_string(), DIM));
        vectors.initialize().await.unwrap();
        let cache = Arc::new(TieredCache::new(
            tmp.path().join("cache"),
            1024 * 1024,
            4 * 1024 * 1024,
            0,
        ));
        cache.initialize().await.unwrap();

        let kb = KnowledgeBase::new(
            embedder,
            vectors,
            cache,
            tmp.path().join("patterns"),
            "test-model".to_string(),
        );
        kb.initialize().await.unwrap();
        Fixture {
            _tmp: tmp,
            kb,
            index,
        }
    }

    fn pattern(kind: PatternKind, title: &str, body: &str) -> Pattern {
        Pattern::new(kind, title, body)
    }

    #[tokio::test]
    async fn test_index_then_search_roundtrip() {
        let f = fixture().await;
        let id = f
            .kb
            .index(pattern(
                PatternKind::Code,
                "connection pool retry strategy",
                "retry with exponential backoff",
            ))
            .await
            .unwrap();

        let outcome = f
            .kb
            .search("connection pool retry strategy", 1, None)
            .await
            .unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].pattern.id, id);
        assert!(outcome.hits[0].score >= 0.5);
        assert!(!outcome.cache_hit);
    }

    #[tokio::test]
    async fn test_second_identical_search_hits_cache() {
        let f = fixture().await;
        f.kb.index(pattern(PatternKind::Code, "alpha", "beta"))
            .await
            .unwrap();

        let first = f.kb.search("alpha", 5, None).await.unwrap();
        assert!(!first.cache_hit);
        let second = f.kb.search("alpha", 5, None).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.hits, second.hits);
    }

    #[tokio::test]
    async fn test_delete_removes_from_search() {
        let f = fixture().await;
        let id = f
            .kb
            .index(pattern(PatternKind::Code, "ephemeral pattern", "body"))
            .await
            .unwrap();
        f.kb.delete(&id).await.unwrap();

        let outcome = f.kb.search("ephemeral pattern", 10, None).await.unwrap();
        assert!(outcome.hits.iter().all(|h| h.pattern.id != id));
        assert!(f.kb.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_rolls_back_sidecar_on_vector_failure() {
        let f = fixture().await;
        f.index.set_offline(true);

        let err = f
            .kb
            .index(pattern(PatternKind::Code, "doomed", "body"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "vector-unavailable");

        // Not visible: no sidecar survived the rollback.
        assert!(f.kb.sidecars().list_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_degraded_search_returns_empty_ok() {
        let f = fixture().await;
        f.kb.index(pattern(PatternKind::Code, "present", "body"))
            .await
            .unwrap();
        f.index.set_offline(true);

        let outcome = f.kb.search("present", 5, None).await.unwrap();
        assert!(outcome.hits.is_empty());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_kind_tagged_queries() {
        let f = fixture().await;
        f.kb.index(pattern(PatternKind::Adr, "first decision", "use X"))
            .await
            .unwrap();

        let filter = SearchFilter {
            kinds: vec![PatternKind::Adr],
            ..Default::default()
        };
        let miss = f.kb.search("decision", 5, Some(&filter)).await.unwrap();
        assert!(!miss.cache_hit);
        let hit = f.kb.search("decision", 5, Some(&filter)).await.unwrap();
        assert!(hit.cache_hit);

        // Indexing another ADR invalidates the adr-tagged query cache.
        f.kb.index(pattern(PatternKind::Adr, "second decision", "use Y"))
            .await
            .unwrap();
        let after = f.kb.search("decision", 5, Some(&filter)).await.unwrap();
        assert!(!after.cache_hit);
        assert_eq!(after.hits.len(), 2);
    }

    #[tokio::test]
    async fn test_update_reembeds_changed_text() {
        let f = fixture().await;
        let id = f
            .kb
            .index(pattern(PatternKind::Code, "original topic", "body"))
            .await
            .unwrap();

        f.kb.update(
            &id,
            PatternUpdate {
                title: Some("entirely different subject".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let outcome = f
            .kb
            .search("entirely different subject", 1, None)
            .await
            .unwrap();
        assert_eq!(outcome.hits[0].pattern.id, id);
        assert_eq!(outcome.hits[0].pattern.title, "entirely different subject");
    }

    #[tokio::test]
    async fn test_orphan_vectors_dropped_from_results_and_swept() {
        let f = fixture().await;
        let id = f
            .kb
            .index(pattern(PatternKind::Code, "orphan candidate", "body"))
            .await
            .unwrap();

        // Simulate a crash between sidecar delete and vector delete.
        f.kb.sidecars().remove(&id).unwrap();

        let outcome = f.kb.search("orphan candidate", 5, None).await.unwrap();
        assert!(outcome.hits.is_empty());

        let reaped = f.kb.sweep_orphans().await.unwrap();
        assert_eq!(reaped, 1);
    }

    #[tokio::test]
    async fn test_similar_to_excludes_self() {
        let f = fixture().await;
        let a = f
            .kb
            .index(pattern(PatternKind::Code, "tokio worker pool", "spawn workers"))
            .await
            .unwrap();
        let b = f
            .kb
            .index(pattern(PatternKind::Code, "tokio worker threads", "spawn threads"))
            .await
            .unwrap();

        let hits = f.kb.similar_to(&a, 5).await.unwrap();
        assert!(hits.iter().all(|h| h.pattern.id != a));
        assert!(hits.iter().any(|h| h.pattern.id == b));
    }
}
