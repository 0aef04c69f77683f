//! Server runner for the upload and download services.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tonic::transport::Server;

use filexfer::TransferContext;

use crate::config::ServerConfig;
use crate::download::DownloadService;
use crate::proto::file_download_server::FileDownloadServer;
use crate::proto::file_upload_server::FileUploadServer;
use crate::upload::UploadService;

/// Server configuration and runner.
#[derive(Debug)]
pub struct TransferServer {
    config: ServerConfig,
}

impl TransferServer {
    /// Create a server from its configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Open storage, reconcile it, and serve until a shutdown signal.
    pub async fn run(self) -> anyhow::Result<()> {
        let ctx = Arc::new(self.config.build_context().await?);
        if self.config.no_reconcile {
            tracing::warn!("skipping storage recovery");
        } else {
            ctx.recover().await?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        serve(
            ctx,
            self.config.upload_addr,
            self.config.download_addr,
            shutdown_rx,
        )
        .await?;

        tracing::info!("gRPC servers shut down");
        Ok(())
    }
}

/// Serve both services until `shutdown` flips to `true`.
///
/// When both addresses are equal the services share one listener.
pub async fn serve(
    ctx: Arc<TransferContext>,
    upload_addr: SocketAddr,
    download_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let upload = FileUploadServer::new(UploadService::new(Arc::clone(&ctx)));
    let download = FileDownloadServer::new(DownloadService::new(ctx));

    if upload_addr == download_addr {
        tracing::info!("Starting upload and download services on {}", upload_addr);
        Server::builder()
            .add_service(upload)
            .add_service(download)
            .serve_with_shutdown(upload_addr, wait_for(shutdown))
            .await?;
        return Ok(());
    }

    tracing::info!("Starting upload service on {}", upload_addr);
    tracing::info!("Starting download service on {}", download_addr);
    let upload_server = Server::builder()
        .add_service(upload)
        .serve_with_shutdown(upload_addr, wait_for(shutdown.clone()));
    let download_server = Server::builder()
        .add_service(download)
        .serve_with_shutdown(download_addr, wait_for(shutdown));

    tokio::try_join!(upload_server, download_server)?;
    Ok(())
}

fn wait_for(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> {
    async move {
        // A dropped sender also ends the wait
        let _ = shutdown.wait_for(|stop| *stop).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, draining in-flight transfers");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, draining in-flight transfers");
        }
    }
}
