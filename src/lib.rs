//! # MCP Codebase Insight
//!
//! A code-intelligence server: source text, architectural decision records
//! and documentation are indexed as dense vectors for semantic retrieval,
//! and exposed to LLM agents, IDE plugins and CLI users through a dual
//! transport — a JSON HTTP API and a persistent SSE tool channel.
//!
//! ## Architecture
//!
//! The server is a set of components initialized in dependency order and
//! held in a typed registry:
//!
//! - [`config`]: layered configuration (defaults < file < env < flags)
//! - [`embedder`]: text-to-vector pipeline with batching and warm-up
//! - [`vector`]: collection-scoped wrapper over the external vector index
//! - [`cache`]: two-tier (memory LRU + disk) key/value cache with TTL
//! - [`knowledge`]: the vector-backed knowledge base and its sidecars
//! - [`adr`]: filesystem-backed ADR records with a status state machine
//! - [`docs`]: bounded-concurrency documentation crawler
//! - [`debug`]: issue-to-diagnostic-steps analyzer
//! - [`tasks`]: bounded-queue async workflow engine
//! - [`health`]: per-component status polling and aggregation
//! - [`server`]: HTTP router, SSE transport and lifecycle owner
//!
//! ## Degraded mode
//!
//! The external vector index is a non-critical dependency: when it is
//! unreachable the server stays up, searches return empty result sets, and
//! writes that need the index fail with a retryable error until the next
//! successful health probe.

pub mod adr;
pub mod cache;
pub mod config;
pub mod core;
pub mod debug;
pub mod docs;
pub mod embedder;
pub mod health;
pub mod knowledge;
pub mod metrics;
pub mod providers;
pub mod server;
pub mod tasks;
pub mod vector;

pub use crate::config::{Config, ConfigOverrides};
pub use crate::core::error::{Error, Result};
pub use crate::server::Server;
