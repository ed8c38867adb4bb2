//! Server component: lifecycle owner and HTTP/SSE host
//!
//! Builds every component in dependency order, keeps them in a typed
//! registry that is immutable after initialization, serves the HTTP and SSE
//! surfaces, and tears everything down in reverse order at shutdown.
//! Critical component failures abort startup; non-critical ones are logged,
//! marked unavailable and gate the SSE tools that depend on them.

pub mod http;
pub mod sse;
pub mod tools;

use crate::adr::AdrManager;
use crate::cache::TieredCache;
use crate::config::Config;
use crate::core::component::Component;
use crate::core::error::{Error, Result};
use crate::debug::DebugAnalyzer;
use crate::docs::DocManager;
use crate::embedder::Embedder;
use crate::health::HealthMonitor;
use crate::knowledge::KnowledgeBase;
use crate::metrics::Metrics;
use crate::providers::{
    EmbeddingProvider, InMemoryVectorIndex, LocalEmbeddingProvider, OllamaEmbeddingProvider,
    QdrantVectorIndex, VectorIndexProvider,
};
use crate::tasks::{TaskContext, TaskManager};
use crate::vector::VectorStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Typed component registry, immutable after initialization
///
/// Request handlers and the SSE tool dispatcher borrow component references
/// from here; nothing is registered or replaced after startup.
pub struct ComponentRegistry {
    pub config: Arc<Config>,
    pub embedder: Arc<Embedder>,
    pub vectors: Arc<VectorStore>,
    pub cache: Arc<TieredCache>,
    pub kb: Arc<KnowledgeBase>,
    pub adrs: Arc<AdrManager>,
    pub docs: Arc<DocManager>,
    pub debug: Arc<DebugAnalyzer>,
    pub tasks: Arc<TaskManager>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<Metrics>,
}

/// Tracks in-flight HTTP requests so shutdown can drain them
pub struct ConnectionTracker {
    active: AtomicUsize,
    draining: AtomicBool,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// `None` once the server is draining; otherwise a guard that releases
    /// the slot on drop
    pub fn request_start(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.draining.load(Ordering::SeqCst) {
            return None;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Wait until in-flight requests hit zero or the deadline elapses
    pub async fn drain(&self, deadline: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        while self.active_count() > 0 {
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        true
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII slot for one in-flight request
pub struct RequestGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The assembled server, ready to serve or to hand its router to tests
pub struct Server {
    registry: Arc<ComponentRegistry>,
    components: Vec<Arc<dyn Component>>,
    availability: HashMap<&'static str, bool>,
    tracker: Arc<ConnectionTracker>,
    sse: Arc<sse::SseState>,
    shutdown: CancellationToken,
}

impl Server {
    /// Initialize all components in dependency order with the providers
    /// named in the configuration
    pub async fn build(config: Config) -> Result<Self> {
        let embedding_provider: Arc<dyn EmbeddingProvider> =
            match config.embedding_provider.as_str() {
                "ollama" => Arc::new(OllamaEmbeddingProvider::new(
                    config.ollama_url.clone(),
                    config.embedding_model.clone(),
                    config.embedding_dim,
                )?),
                _ => Arc::new(LocalEmbeddingProvider::new(
                    config.embedding_model.clone(),
                    config.embedding_dim,
                )),
            };
        let vector_provider: Arc<dyn VectorIndexProvider> = match config.vector_provider.as_str() {
            "memory" => Arc::new(InMemoryVectorIndex::new()),
            _ => Arc::new(QdrantVectorIndex::new(
                config.vector_endpoint.clone(),
                config.vector_api_key.clone(),
            )?),
        };
        Self::build_with_providers(config, embedding_provider, vector_provider).await
    }

    /// Initialize with explicit providers; lets callers keep a handle to an
    /// in-process provider (tests, embedded use)
    pub async fn build_with_providers(
        config: Config,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        vector_provider: Arc<dyn VectorIndexProvider>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());

        let embedder = Arc::new(Embedder::new(embedding_provider, config.embedding_dim));
        let vectors = Arc::new(VectorStore::new(
            vector_provider,
            config.collection_name.clone(),
            config.embedding_dim,
        ));
        let cache = Arc::new(TieredCache::new(
            config.cache_dir.clone(),
            config.cache_mem_bytes,
            config.cache_disk_bytes,
            config.cache_ttl_seconds,
        ));
        let kb = Arc::new(KnowledgeBase::new(
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            Arc::clone(&cache),
            config.patterns_dir(),
            config.embedding_model.clone(),
        ));
        let adrs = Arc::new(AdrManager::new(config.adr_dir.clone(), Arc::clone(&kb)));
        let docs = Arc::new(DocManager::new(
            Arc::clone(&kb),
            config.docs_dir.clone(),
            config.crawl_max_inflight,
            config.crawl_retries,
        )?);
        let debug = Arc::new(DebugAnalyzer::new(Arc::clone(&kb)));
        let tasks = Arc::new(TaskManager::new(
            TaskContext {
                kb: Arc::clone(&kb),
                adrs: Arc::clone(&adrs),
                docs: Arc::clone(&docs),
                debug: Arc::clone(&debug),
            },
            config.tasks_dir(),
            config.task_workers,
            config.task_queue_depth,
            config.task_retries,
            Arc::clone(&metrics),
        ));

        // Init order: leaves first, then the orchestrators that use them.
        let ordered: Vec<(Arc<dyn Component>, bool)> = vec![
            (embedder.clone() as Arc<dyn Component>, true),
            (vectors.clone() as Arc<dyn Component>, false),
            (cache.clone() as Arc<dyn Component>, false),
            (kb.clone() as Arc<dyn Component>, true),
            (adrs.clone() as Arc<dyn Component>, false),
            (docs.clone() as Arc<dyn Component>, false),
            (debug.clone() as Arc<dyn Component>, false),
            (tasks.clone() as Arc<dyn Component>, true),
        ];

        let mut availability: HashMap<&'static str, bool> = HashMap::new();
        let mut initialized: Vec<Arc<dyn Component>> = Vec::new();
        for (component, critical) in &ordered {
            match component.initialize().await {
                Ok(()) => {
                    availability.insert(component.name(), true);
                    initialized.push(Arc::clone(component));
                }
                Err(e) if *critical => {
                    tracing::error!("critical component {} failed: {}", component.name(), e);
                    // Best-effort teardown of what already came up.
                    for done in initialized.iter().rev() {
                        let _ = done.cleanup().await;
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "component {} unavailable, continuing without it: {}",
                        component.name(),
                        e
                    );
                    availability.insert(component.name(), false);
                }
            }
        }

        if config.strict_init && vectors.is_degraded() {
            return Err(Error::vector_unavailable(
                "vector index unreachable at init (strict mode)",
            ));
        }

        let health = Arc::new(HealthMonitor::new(
            ordered.iter().map(|(c, _)| Arc::clone(c)).collect(),
            std::time::Duration::from_secs(config.health_poll_seconds),
        ));
        health.initialize().await?;
        crate::health::spawn_poll_loop(Arc::clone(&health));

        let registry = Arc::new(ComponentRegistry {
            config,
            embedder,
            vectors,
            cache,
            kb,
            adrs,
            docs,
            debug,
            tasks,
            health,
            metrics,
        });

        let tool_registry = Arc::new(tools::ToolRegistry::build(&availability));
        let sse = Arc::new(sse::SseState::new(Arc::clone(&registry), tool_registry));

        let mut components = vec![];
        components.extend(ordered.into_iter().map(|(c, _)| c));
        components.push(registry.health.clone() as Arc<dyn Component>);

        Ok(Self {
            registry,
            components,
            availability,
            tracker: Arc::new(ConnectionTracker::new()),
            sse,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> Arc<ComponentRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn availability(&self) -> &HashMap<&'static str, bool> {
        &self.availability
    }

    pub fn sse_state(&self) -> Arc<sse::SseState> {
        Arc::clone(&self.sse)
    }

    /// Axum router over the shared state; also used directly by tests
    pub fn router(&self) -> axum::Router {
        http::build_router(http::AppState {
            registry: Arc::clone(&self.registry),
            tracker: Arc::clone(&self.tracker),
            sse: Arc::clone(&self.sse),
        })
    }

    /// Serve until SIGINT/SIGTERM, then run the shutdown sequence
    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.registry.config.host, self.registry.config.port
        );
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("listening on http://{}", listener.local_addr()?);

        let router = self.router();
        let shutdown = self.shutdown.clone();
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        let shutdown_trigger = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            shutdown_trigger.cancel();
        });

        serve.await?;
        self.teardown().await;
        Ok(())
    }

    /// Stop accepting requests, close SSE sessions, drain tasks, clean up
    /// components in reverse init order
    pub async fn teardown(&self) {
        let deadline = self.registry.config.shutdown_deadline();

        self.tracker.start_draining();
        if !self.tracker.drain(deadline).await {
            tracing::warn!("shutdown: requests still in flight after deadline");
        }

        self.sse.close_all().await;

        if !self.registry.tasks.drain(deadline).await {
            tracing::warn!("shutdown: tasks still running after deadline");
        }

        for component in self.components.iter().rev() {
            if let Err(e) = component.cleanup().await {
                tracing::warn!("cleanup of {} failed: {}", component.name(), e);
            }
        }
        tracing::info!("shutdown complete");
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
