use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// 50 MiB — recommended chunk size returned to clients at initiation.
const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub public_base_url: String,
    pub chunk_size: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload coordinator for course video files")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_COORDINATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_COORDINATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory backing the blob store (overrides UPLOAD_COORDINATOR_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Public base URL prefixed onto object keys in completion responses
    /// (overrides UPLOAD_COORDINATOR_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Recommended chunk size in bytes (overrides UPLOAD_COORDINATOR_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_COORDINATOR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("UPLOAD_COORDINATOR_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing UPLOAD_COORDINATOR_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading UPLOAD_COORDINATOR_PORT"),
        };
        let env_storage =
            env::var("UPLOAD_COORDINATOR_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_public_base = env::var("UPLOAD_COORDINATOR_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000/files".into());
        let env_chunk_size = match env::var("UPLOAD_COORDINATOR_CHUNK_SIZE") {
            Ok(value) => value.parse::<u64>().with_context(|| {
                format!("parsing UPLOAD_COORDINATOR_CHUNK_SIZE value `{}`", value)
            })?,
            Err(env::VarError::NotPresent) => DEFAULT_CHUNK_SIZE,
            Err(err) => return Err(err).context("reading UPLOAD_COORDINATOR_CHUNK_SIZE"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            public_base_url: args.public_base_url.unwrap_or(env_public_base),
            chunk_size: args.chunk_size.unwrap_or(env_chunk_size),
        };

        anyhow::ensure!(cfg.chunk_size > 0, "chunk size must be positive");

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
