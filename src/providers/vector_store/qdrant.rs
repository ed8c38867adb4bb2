//! Qdrant vector index provider
//!
//! Talks to a Qdrant instance over its REST API. Network failures map to
//! `vector-unavailable` so the knowledge base can degrade instead of
//! propagating a fatal error.

use crate::core::error::{Error, Result};
use crate::core::types::{ScoredPoint, SearchFilter};
use crate::providers::{VectorIndexProvider, VectorPayload};
use async_trait::async_trait;
use std::time::Duration;

const API_KEY_HEADER: &str = "api-key";
const SCROLL_PAGE: usize = 1024;

/// Qdrant REST vector index provider
pub struct QdrantVectorIndex {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl QdrantVectorIndex {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(10))
    }

    pub fn with_timeout(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::vector_unavailable(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::vector_unavailable(format!("qdrant request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("qdrant resource"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::vector_unavailable(format!(
                "qdrant error {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::vector_unavailable(format!("malformed qdrant response: {e}")))
    }

    /// Translate the supported filter clauses into a qdrant payload filter;
    /// `updated_after` stays with the caller
    fn build_filter(filter: &SearchFilter) -> Option<serde_json::Value> {
        let mut must = Vec::new();

        if !filter.kinds.is_empty() {
            let kinds: Vec<&str> = filter.kinds.iter().map(|k| k.as_str()).collect();
            must.push(serde_json::json!({
                "key": "kind",
                "match": { "any": kinds },
            }));
        }
        if let Some(tag) = &filter.tag {
            must.push(serde_json::json!({
                "key": "tags",
                "match": { "value": tag },
            }));
        }
        if let Some(language) = &filter.language {
            must.push(serde_json::json!({
                "key": "language",
                "match": { "value": language },
            }));
        }

        if must.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "must": must }))
        }
    }
}

#[async_trait]
impl VectorIndexProvider for QdrantVectorIndex {
    async fn ensure_collection(&self, name: &str, dimensions: usize) -> Result<()> {
        match self
            .send(self.request(reqwest::Method::GET, &format!("/collections/{name}")))
            .await
        {
            Ok(info) => {
                let existing = info["result"]["config"]["params"]["vectors"]["size"]
                    .as_u64()
                    .unwrap_or(0) as usize;
                if existing != dimensions {
                    return Err(Error::VectorSchemaMismatch {
                        message: format!(
                            "collection '{name}' has dimension {existing}, requested {dimensions}"
                        ),
                    });
                }
                Ok(())
            }
            Err(Error::NotFound { .. }) => {
                let body = serde_json::json!({
                    "vectors": { "size": dimensions, "distance": "Cosine" },
                });
                self.send(
                    self.request(reqwest::Method::PUT, &format!("/collections/{name}"))
                        .json(&body),
                )
                .await?;
                tracing::info!("created qdrant collection '{}' (dim {})", name, dimensions);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: VectorPayload,
    ) -> Result<()> {
        let body = serde_json::json!({
            "points": [{ "id": id, "vector": vector, "payload": payload }],
        });
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "vector": query,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(qdrant_filter) = filter.and_then(Self::build_filter) {
            body["filter"] = qdrant_filter;
        }

        let response = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points/search"),
                )
                .json(&body),
            )
            .await?;

        let mut hits: Vec<ScoredPoint> = response["result"]
            .as_array()
            .map(|points| {
                points
                    .iter()
                    .map(|p| ScoredPoint {
                        id: point_id(&p["id"]),
                        score: (p["score"].as_f64().unwrap_or(0.0) as f32).clamp(0.0, 1.0),
                        payload: p["payload"].as_object().cloned().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Qdrant orders by score; re-sort to pin the tie-break by id.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let body = serde_json::json!({ "points": [id] });
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
            )
            .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorPayload>> {
        let body = serde_json::json!({ "ids": [id], "with_payload": true });
        let response = match self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{collection}/points"),
                )
                .json(&body),
            )
            .await
        {
            Ok(response) => response,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(response["result"]
            .as_array()
            .and_then(|points| points.first())
            .and_then(|p| p["payload"].as_object().cloned()))
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut offset: Option<serde_json::Value> = None;

        loop {
            let mut body = serde_json::json!({
                "limit": SCROLL_PAGE,
                "with_payload": false,
                "with_vector": false,
            });
            if let Some(next) = &offset {
                body["offset"] = next.clone();
            }

            let response = self
                .send(
                    self.request(
                        reqwest::Method::POST,
                        &format!("/collections/{collection}/points/scroll"),
                    )
                    .json(&body),
                )
                .await?;

            if let Some(points) = response["result"]["points"].as_array() {
                ids.extend(points.iter().map(|p| point_id(&p["id"])));
            }

            match response["result"]["next_page_offset"].clone() {
                serde_json::Value::Null => break,
                next => offset = Some(next),
            }
        }

        Ok(ids)
    }

    fn provider_name(&self) -> &'static str {
        "qdrant"
    }

    async fn health_check(&self) -> Result<()> {
        self.send(self.request(reqwest::Method::GET, "/collections"))
            .await?;
        Ok(())
    }
}

/// Qdrant point ids come back as either strings or integers
fn point_id(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
