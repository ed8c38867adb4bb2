//! Configuration management
//!
//! Layered configuration: built-in defaults < TOML file < environment
//! variables (prefix `MCP_`) < command-line flags. The resulting [`Config`]
//! is validated once at startup and immutable for the process lifetime.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of memory-cache stripes; power of two so the hash mixes cheaply
pub const CACHE_STRIPES: usize = 16;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP bind address
    pub host: String,
    pub port: u16,

    /// External vector index
    pub vector_endpoint: String,
    #[serde(default)]
    pub vector_api_key: Option<String>,
    pub collection_name: String,
    /// Vector index backend: `qdrant` or `memory`
    pub vector_provider: String,

    /// Embedding pipeline
    pub embedding_model: String,
    pub embedding_dim: usize,
    /// Embedding backend: `local` or `ollama`
    pub embedding_provider: String,
    pub ollama_url: String,

    /// Filesystem roots
    pub adr_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub kb_dir: PathBuf,
    pub cache_dir: PathBuf,

    /// Cache budgets
    pub cache_mem_bytes: u64,
    pub cache_disk_bytes: u64,
    pub cache_ttl_seconds: u64,

    /// Task orchestration
    pub task_workers: usize,
    pub task_queue_depth: usize,
    /// Default retry limit for retryable task failures
    pub task_retries: u32,

    /// Documentation crawler
    pub crawl_max_inflight: usize,
    pub crawl_retries: u32,

    /// Minimum severity emitted by the tracing subscriber
    pub log_level: String,

    /// HTTP security toggles
    pub auth_enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Exit with code 69 instead of degrading when a critical dependency is
    /// unavailable at init
    pub strict_init: bool,

    pub shutdown_deadline_seconds: u64,
    pub health_poll_seconds: u64,
}

/// Flag-level overrides collected by the CLI; every field beats env and file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vector_endpoint: Option<String>,
    pub collection_name: Option<String>,
    pub log_level: Option<String>,
    pub task_workers: Option<usize>,
    pub strict_init: Option<bool>,
}

impl Config {
    /// Load configuration from all layered sources
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();

        for (key, value) in Self::defaults() {
            builder = builder
                .set_default(key, value)
                .map_err(|e| Error::config(e.to_string()))?;
        }

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        } else {
            builder = builder.add_source(
                config::File::with_name("codebase-insight").required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MCP")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_origins"),
        );

        let mut cfg: Config = builder
            .build()
            .map_err(|e| Error::config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::config(e.to_string()))?;

        cfg.apply_overrides(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults() -> Vec<(&'static str, config::Value)> {
        vec![
            ("host", "127.0.0.1".into()),
            ("port", 3000i64.into()),
            ("vector_endpoint", "http://127.0.0.1:6333".into()),
            ("collection_name", "codebase_patterns".into()),
            ("vector_provider", "qdrant".into()),
            ("embedding_model", "all-minilm".into()),
            ("embedding_dim", 384i64.into()),
            ("embedding_provider", "local".into()),
            ("ollama_url", "http://127.0.0.1:11434".into()),
            ("adr_dir", "./data/adrs".into()),
            ("docs_dir", "./data/docs".into()),
            ("kb_dir", "./data/kb".into()),
            ("cache_dir", "./data/cache".into()),
            ("cache_mem_bytes", (64i64 * 1024 * 1024).into()),
            ("cache_disk_bytes", (512i64 * 1024 * 1024).into()),
            ("cache_ttl_seconds", 3600i64.into()),
            ("task_workers", 4i64.into()),
            ("task_queue_depth", 64i64.into()),
            ("task_retries", 0i64.into()),
            ("crawl_max_inflight", 4i64.into()),
            ("crawl_retries", 0i64.into()),
            ("log_level", "info".into()),
            ("auth_enabled", false.into()),
            ("strict_init", false.into()),
            ("shutdown_deadline_seconds", 30i64.into()),
            ("health_poll_seconds", 30i64.into()),
        ]
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(endpoint) = &overrides.vector_endpoint {
            self.vector_endpoint = endpoint.clone();
        }
        if let Some(collection) = &overrides.collection_name {
            self.collection_name = collection.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.log_level = level.clone();
        }
        if let Some(workers) = overrides.task_workers {
            self.task_workers = workers;
        }
        if let Some(strict) = overrides.strict_init {
            self.strict_init = strict;
        }
    }

    /// Validate the assembled configuration
    ///
    /// Creates the filesystem roots and probes them for writability; a root
    /// that cannot be written is a startup failure, not a runtime surprise.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(Error::config("embedding_dim must be > 0"));
        }
        if self.task_workers == 0 {
            return Err(Error::config("task_workers must be > 0"));
        }
        if self.task_queue_depth == 0 {
            return Err(Error::config("task_queue_depth must be > 0"));
        }
        if self.crawl_max_inflight == 0 {
            return Err(Error::config("crawl_max_inflight must be > 0"));
        }

        reqwest::Url::parse(&self.vector_endpoint)
            .map_err(|e| Error::config(format!("vector_endpoint malformed: {e}")))?;

        match self.vector_provider.as_str() {
            "qdrant" | "memory" => {}
            other => {
                return Err(Error::config(format!(
                    "unknown vector_provider '{other}' (expected qdrant or memory)"
                )))
            }
        }
        match self.embedding_provider.as_str() {
            "local" | "ollama" => {}
            other => {
                return Err(Error::config(format!(
                    "unknown embedding_provider '{other}' (expected local or ollama)"
                )))
            }
        }

        if self.auth_enabled && self.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(Error::config("auth_enabled requires api_key"));
        }

        for dir in [&self.adr_dir, &self.docs_dir, &self.kb_dir, &self.cache_dir] {
            Self::probe_writable(dir)?;
        }

        Ok(())
    }

    fn probe_writable(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::config(format!("cannot create {}: {e}", dir.display())))?;
        let probe = dir.join(".write-probe");
        std::fs::write(&probe, b"probe")
            .map_err(|e| Error::config(format!("{} not writable: {e}", dir.display())))?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    /// Directory of pattern sidecars
    pub fn patterns_dir(&self) -> PathBuf {
        self.kb_dir.join("patterns")
    }

    /// Directory of task sidecars
    pub fn tasks_dir(&self) -> PathBuf {
        self.kb_dir.join("tasks")
    }

    pub fn shutdown_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_deadline_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            vector_endpoint: "http://127.0.0.1:6333".to_string(),
            vector_api_key: None,
            collection_name: "test_patterns".to_string(),
            vector_provider: "memory".to_string(),
            embedding_model: "all-minilm".to_string(),
            embedding_dim: 64,
            embedding_provider: "local".to_string(),
            ollama_url: "http://127.0.0.1:11434".to_string(),
            adr_dir: root.join("adrs"),
            docs_dir: root.join("docs"),
            kb_dir: root.join("kb"),
            cache_dir: root.join("cache"),
            cache_mem_bytes: 1024 * 1024,
            cache_disk_bytes: 4 * 1024 * 1024,
            cache_ttl_seconds: 60,
            task_workers: 2,
            task_queue_depth: 8,
            task_retries: 0,
            crawl_max_inflight: 2,
            crawl_retries: 0,
            log_level: "debug".to_string(),
            auth_enabled: false,
            api_key: None,
            allowed_origins: Vec::new(),
            strict_init: false,
            shutdown_deadline_seconds: 5,
            health_poll_seconds: 30,
        }
    }

    #[test]
    fn test_defaults_load_and_validate() {
        let tmp = TempDir::new().unwrap();
        let overrides = ConfigOverrides::default();
        // Point the filesystem roots somewhere writable before validation.
        let mut cfg = test_config(tmp.path());
        cfg.apply_overrides(&overrides);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_dim_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.embedding_dim = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "config-invalid");
    }

    #[test]
    fn test_malformed_endpoint_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.vector_endpoint = "not a url".to_string();
        assert_eq!(cfg.validate().unwrap_err().kind(), "config-invalid");
    }

    #[test]
    fn test_auth_requires_key() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.auth_enabled = true;
        assert_eq!(cfg.validate().unwrap_err().kind(), "config-invalid");
        cfg.api_key = Some("secret".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_flag_overrides_beat_defaults() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = test_config(tmp.path());
        let overrides = ConfigOverrides {
            port: Some(8081),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.log_level, "trace");
    }
}
