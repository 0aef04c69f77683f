//! filexfer CLI - Client for the filexfer services
//!
//! Usage:
//!   filexfer upload report.pdf --content-type application/pdf
//!   filexfer download <file-id> copy.pdf
//!   filexfer list
//!   filexfer metadata <file-id>
//!   filexfer token --subject 42        Mint a token (needs JWT_SECRET)
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use filexfer::Authenticator;
use filexfer_grpc::FileClient;
use filexfer_grpc::proto::{FileMetadata, UploadFileResponse};

/// filexfer CLI - Upload, download and list files
#[derive(Parser, Debug)]
#[command(name = "filexfer")]
#[command(about = "Client for the filexfer upload and download services")]
struct Cli {
    /// Upload service endpoint
    #[arg(long, env = "UPLOAD_ENDPOINT", default_value = "http://[::1]:50051")]
    upload_addr: String,

    /// Download service endpoint
    #[arg(long, env = "DOWNLOAD_ENDPOINT", default_value = "http://[::1]:50052")]
    download_addr: String,

    /// Bearer token sent with every call
    #[arg(long, env = "FILEXFER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        /// File to upload
        path: PathBuf,
        /// MIME type recorded with the file
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Download a stored file
    Download {
        /// Id returned by upload
        file_id: String,
        /// Where to write the content
        out: PathBuf,
    },
    /// List files owned by the caller
    List,
    /// Show metadata of one stored file
    Metadata {
        /// Id returned by upload
        file_id: String,
    },
    /// Mint a token signed with the server secret
    Token {
        /// Subject recorded as the file owner
        #[arg(long)]
        subject: String,
        /// Server signing secret
        #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
        secret: String,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

fn metadata_json(m: &FileMetadata) -> Value {
    json!({
        "file_id": m.file_id,
        "filename": m.filename,
        "content_type": m.content_type,
        "size": m.size,
        "created_at": m.created_at,
        "user_id": m.user_id,
    })
}

fn upload_json(r: &UploadFileResponse) -> Value {
    json!({
        "file_id": r.file_id,
        "filename": r.filename,
        "size": r.size,
        "created_at": r.created_at,
        "user_id": r.user_id,
    })
}

async fn connect(upload: &str, download: &str, token: Option<&str>) -> anyhow::Result<FileClient> {
    let token = token.context("no token given; pass --token or set FILEXFER_TOKEN")?;
    FileClient::connect(upload, download, token)
        .await
        .context("connecting to filexfer")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let Cli {
        upload_addr,
        download_addr,
        token,
        command,
    } = Cli::parse();
    let client = || connect(&upload_addr, &download_addr, token.as_deref());

    let output = match command {
        Command::Upload { path, content_type } => {
            let reply = client()
                .await?
                .upload_file(&path, content_type.as_deref())
                .await
                .with_context(|| format!("uploading {}", path.display()))?;
            tracing::info!(file_id = %reply.file_id, "upload complete");
            upload_json(&reply)
        }
        Command::Download { file_id, out } => {
            let metadata = client()
                .await?
                .download_file(&file_id, &out)
                .await
                .with_context(|| format!("downloading {file_id}"))?;
            tracing::info!(path = %out.display(), "download complete");
            metadata_json(&metadata)
        }
        Command::List => {
            let files = client()
                .await?
                .list_files()
                .await
                .context("listing files")?;
            Value::Array(files.iter().map(metadata_json).collect())
        }
        Command::Metadata { file_id } => {
            let metadata = client()
                .await?
                .get_metadata(&file_id)
                .await
                .with_context(|| format!("fetching metadata of {file_id}"))?;
            metadata_json(&metadata)
        }
        Command::Token {
            subject,
            secret,
            ttl_secs,
        } => {
            let token = Authenticator::new(&secret)
                .issue(&subject, Duration::from_secs(ttl_secs))
                .context("minting token")?;
            println!("{token}");
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
