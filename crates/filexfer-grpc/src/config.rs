//! Server configuration from flags and environment.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::Args;

use filexfer::{Authenticator, BlobStore, SqliteIndex, TransferContext, TransferLimits};

/// Everything the server needs to start.
#[derive(Args, Clone)]
pub struct ServerConfig {
    /// Address of the upload service
    #[arg(long, env = "UPLOAD_ADDR", default_value = "[::1]:50051")]
    pub upload_addr: SocketAddr,

    /// Address of the download service
    #[arg(long, env = "DOWNLOAD_ADDR", default_value = "[::1]:50052")]
    pub download_addr: SocketAddr,

    /// Directory holding file content
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub storage_dir: PathBuf,

    /// SQLite database holding file metadata
    #[arg(long, env = "DB_URL", default_value = "sqlite://filexfer.db?mode=rwc")]
    pub database_url: String,

    /// HMAC secret used to verify bearer tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Longest wait for the next frame of a transfer, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub chunk_timeout_ms: u64,

    /// Wall-clock bound on one upload, in milliseconds
    #[arg(long, default_value_t = 3_600_000)]
    pub call_timeout_ms: u64,

    /// Skip the startup sweep of partial and unrecorded blobs
    #[arg(long)]
    pub no_reconcile: bool,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("upload_addr", &self.upload_addr)
            .field("download_addr", &self.download_addr)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("jwt_secret", &"<redacted>")
            .field("chunk_timeout_ms", &self.chunk_timeout_ms)
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("no_reconcile", &self.no_reconcile)
            .finish()
    }
}

impl ServerConfig {
    /// Per-call limits derived from the timeouts.
    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            ..TransferLimits::default()
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.jwt_secret.is_empty(), "JWT secret must not be empty");
        ensure!(self.chunk_timeout_ms > 0, "chunk timeout must be positive");
        ensure!(self.call_timeout_ms > 0, "call timeout must be positive");
        Ok(())
    }

    /// Open storage and the index and assemble the shared context.
    pub async fn build_context(&self) -> anyhow::Result<TransferContext> {
        self.validate()?;
        let limits = self.limits();

        let blobs = BlobStore::open_dir(&self.storage_dir, limits.max_chunk_bytes)
            .await
            .with_context(|| format!("opening storage dir {}", self.storage_dir.display()))?;
        let index = SqliteIndex::connect(&self.database_url)
            .await
            .with_context(|| format!("opening metadata database {}", self.database_url))?;

        Ok(TransferContext::new(
            Authenticator::new(&self.jwt_secret),
            blobs,
            Arc::new(index),
            limits,
        ))
    }
}
