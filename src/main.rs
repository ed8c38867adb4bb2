//! Binary entry point
//!
//! Parses flags, assembles the layered configuration, initializes the
//! component tree and serves until a shutdown signal arrives. Exit codes:
//! 0 on normal shutdown, 64 for invalid configuration, 69 when a required
//! dependency is unavailable at initialization, 70 on internal errors.

use clap::Parser;
use mcp_codebase_insight::{Config, ConfigOverrides, Error, Server};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_CONFIG: u8 = 64;
const EXIT_DEPENDENCY: u8 = 69;
const EXIT_INTERNAL: u8 = 70;

/// Code-intelligence MCP server
#[derive(Parser, Debug)]
#[command(name = "codebase-insight", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind host
    #[arg(long)]
    host: Option<String>,

    /// HTTP bind port
    #[arg(long)]
    port: Option<u16>,

    /// URL of the external vector index
    #[arg(long)]
    vector_endpoint: Option<String>,

    /// Collection name inside the vector index
    #[arg(long)]
    collection: Option<String>,

    /// Minimum log severity (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Number of task workers
    #[arg(long)]
    task_workers: Option<usize>,

    /// Fail startup instead of degrading when the vector index is down
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        vector_endpoint: cli.vector_endpoint,
        collection_name: cli.collection,
        log_level: cli.log_level,
        task_workers: cli.task_workers,
        strict_init: cli.strict.then_some(true),
    };

    let config = match Config::load(cli.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_tracing(&config.log_level);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        "starting codebase-insight"
    );

    let server = match Server::build(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::Config { .. } => EXIT_CONFIG,
        Error::VectorUnavailable { .. }
        | Error::VectorSchemaMismatch { .. }
        | Error::EmbedderUnavailable { .. } => EXIT_DEPENDENCY,
        _ => EXIT_INTERNAL,
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
