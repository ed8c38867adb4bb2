//! Documentation crawler component
//!
//! Fetches source URLs with bounded concurrency, hashes the content and
//! forwards new (url, hash) versions to the knowledge base as doc patterns.
//! HTML parsing stays out of scope; the body is indexed as fetched.

use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::core::types::{Pattern, PatternKind};
use crate::knowledge::KnowledgeBase;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Outcome of one crawl invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrawlReport {
    pub fetched: usize,
    pub indexed: usize,
    /// Same (url, hash) already known; re-crawl is a no-op
    pub unchanged: usize,
    pub failed: Vec<String>,
}

/// Bounded-concurrency documentation crawler
pub struct DocManager {
    kb: Arc<KnowledgeBase>,
    docs_dir: PathBuf,
    client: reqwest::Client,
    inflight: Arc<Semaphore>,
    retries: u32,
    /// source_url -> content_hash of the last indexed version
    seen: DashMap<String, String>,
}

impl DocManager {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        docs_dir: PathBuf,
        max_inflight: usize,
        retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::internal(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            kb,
            docs_dir,
            client,
            inflight: Arc::new(Semaphore::new(max_inflight)),
            retries,
            seen: DashMap::new(),
        })
    }

    /// Crawl a list of URLs; each URL is fetched, hashed, deduplicated and
    /// indexed independently. Cancellation aborts in-flight fetches and is
    /// re-checked before each fetched result is indexed.
    pub async fn crawl(
        &self,
        urls: &[String],
        source_type: &str,
        cancel: &CancellationToken,
    ) -> Result<CrawlReport> {
        let mut report = CrawlReport::default();

        let fetches = urls.iter().map(|url| {
            let url = url.clone();
            let inflight = Arc::clone(&self.inflight);
            let cancel = cancel.clone();
            async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = inflight.acquire().await.ok();
                let result = self.fetch_with_retry(&url, &cancel).await;
                (url, result)
            }
        });
        let results = futures::future::join_all(fetches).await;

        for (url, result) in results {
            if cancel.is_cancelled() {
                tracing::info!("crawl canceled after {} fetches", report.fetched);
                break;
            }
            match result {
                Ok(body) => {
                    report.fetched += 1;
                    let hash = content_hash(&body);
                    if self.seen.get(&url).map(|h| h.clone()) == Some(hash.clone()) {
                        report.unchanged += 1;
                        continue;
                    }
                    match self.index_document(&url, source_type, &body, &hash).await {
                        Ok(()) => {
                            self.seen.insert(url, hash);
                            report.indexed += 1;
                        }
                        Err(e) => {
                            // Retryable indexing failures abort the crawl so
                            // the whole task can be re-enqueued.
                            if e.is_retryable() {
                                return Err(e);
                            }
                            tracing::warn!(url, "document index failed: {}", e);
                            report.failed.push(url);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url, "fetch failed: {}", e);
                    report.failed.push(url);
                }
            }
        }

        Ok(report)
    }

    /// Exponential backoff on 5xx and transport errors, abandon on 4xx.
    /// Cancellation aborts the in-flight request and the backoff sleep.
    async fn fetch_with_retry(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::internal("crawl canceled"));
            }
            let outcome = tokio::select! {
                outcome = self.fetch_once(url) => outcome,
                _ = cancel.cancelled() => return Err(Error::internal("crawl canceled")),
            };
            match outcome {
                Ok(body) => return Ok(body),
                Err(FetchError::Permanent(message)) => {
                    return Err(Error::validation(message));
                }
                Err(FetchError::Transient(message)) => {
                    if attempt >= self.retries {
                        return Err(Error::internal(message));
                    }
                    let backoff = BACKOFF_BASE
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(BACKOFF_CAP);
                    tracing::debug!(url, attempt, "retrying fetch in {:?}", backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(Error::internal("crawl canceled")),
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("client error {status} for {url}")));
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!("server error {status} for {url}")));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("body read failed: {e}")))
    }

    async fn index_document(
        &self,
        url: &str,
        source_type: &str,
        body: &str,
        hash: &str,
    ) -> Result<()> {
        let mut pattern = Pattern::new(PatternKind::Doc, title_from_url(url), body);
        pattern.tags = vec![source_type.to_string()];
        pattern
            .extra
            .insert("source_url".to_string(), serde_json::json!(url));
        pattern
            .extra
            .insert("content_hash".to_string(), serde_json::json!(hash));
        pattern.extra.insert(
            "fetched_at".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );

        let id = self.kb.index(pattern).await?;

        // Local mirror is best-effort; the sidecar is the record of truth.
        let mirror = self.docs_dir.join(format!("{hash}.txt"));
        if let Err(e) = std::fs::write(&mirror, body) {
            tracing::debug!(id, "doc mirror write failed: {}", e);
        }
        Ok(())
    }
}

enum FetchError {
    /// 4xx: the URL is wrong, retrying will not help
    Permanent(String),
    /// 5xx or transport: worth backing off and retrying
    Transient(String),
}

fn content_hash(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn title_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains("://"))
        .unwrap_or(url)
        .to_string()
}

#[async_trait]
impl Component for DocManager {
    fn name(&self) -> &'static str {
        "doc-manager"
    }

    async fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.docs_dir)?;

        // Rebuild the dedup map from existing doc sidecars.
        for pattern in self.kb.sidecars().load_all()? {
            if pattern.kind != PatternKind::Doc {
                continue;
            }
            let url = pattern.extra.get("source_url").and_then(|v| v.as_str());
            let hash = pattern.extra.get("content_hash").and_then(|v| v.as_str());
            if let (Some(url), Some(hash)) = (url, hash) {
                self.seen.insert(url.to_string(), hash.to_string());
            }
        }
        tracing::info!(known_docs = self.seen.len(), "doc manager ready");
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        if self.docs_dir.exists() {
            ComponentStatus::healthy()
        } else {
            ComponentStatus::unhealthy("docs directory missing")
        }
    }

    fn is_critical(&self) -> bool {
        false
    }
}
