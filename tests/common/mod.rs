//! Shared fixture for integration tests: a full server over the in-memory
//! vector index and the local embedder, bound to an ephemeral port.

use mcp_codebase_insight::config::Config;
use mcp_codebase_insight::providers::{InMemoryVectorIndex, LocalEmbeddingProvider};
use mcp_codebase_insight::server::Server;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const DIM: usize = 256;
pub const MODEL: &str = "test-model";

pub struct TestServer {
    pub base_url: String,
    pub index: Arc<InMemoryVectorIndex>,
    #[allow(dead_code)]
    pub server: Server,
    pub client: reqwest::Client,
    _tmp: TempDir,
}

pub fn test_config(root: &Path, workers: usize, queue_depth: usize) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        vector_endpoint: "http://127.0.0.1:6333".to_string(),
        vector_api_key: None,
        collection_name: "test_patterns".to_string(),
        vector_provider: "memory".to_string(),
        embedding_model: MODEL.to_string(),
        embedding_dim: DIM,
        embedding_provider: "local".to_string(),
        ollama_url: "http://127.0.0.1:11434".to_string(),
        adr_dir: root.join("adrs"),
        docs_dir: root.join("docs"),
        kb_dir: root.join("kb"),
        cache_dir: root.join("cache"),
        cache_mem_bytes: 4 * 1024 * 1024,
        cache_disk_bytes: 16 * 1024 * 1024,
        cache_ttl_seconds: 300,
        task_workers: workers,
        task_queue_depth: queue_depth,
        task_retries: 0,
        crawl_max_inflight: 2,
        crawl_retries: 0,
        log_level: "warn".to_string(),
        auth_enabled: false,
        api_key: None,
        allowed_origins: Vec::new(),
        strict_init: false,
        shutdown_deadline_seconds: 5,
        health_poll_seconds: 30,
    }
}

pub async fn spawn(workers: usize, queue_depth: usize) -> TestServer {
    spawn_with(workers, queue_depth, false).await
}

pub async fn spawn_with(workers: usize, queue_depth: usize, index_offline: bool) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), workers, queue_depth);

    let index = Arc::new(InMemoryVectorIndex::new());
    index.set_offline(index_offline);
    let embedder = Arc::new(LocalEmbeddingProvider::new(MODEL, DIM));

    let server = Server::build_with_providers(config, embedder, index.clone())
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        index,
        server,
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn get_json(&self, path: &str) -> serde_json::Value {
        self.client
            .get(self.url(path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll a task until it reaches a terminal state
    pub async fn wait_for_task(&self, task_id: &str) -> serde_json::Value {
        for _ in 0..200 {
            let task = self.get_json(&format!("/tools/get-task/{task_id}")).await;
            let state = task["state"].as_str().unwrap_or_default().to_string();
            if matches!(state.as_str(), "succeeded" | "failed" | "canceled") {
                return task;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }
}
