//! filexfer gRPC services
//!
//! Exposes the transfer protocol as two gRPC services. `FileUpload` takes a
//! client stream of upload messages and answers with the stored file's id;
//! `FileDownload` answers a file id with a server stream of download
//! messages. Every call carries `authorization: Bearer <token>` metadata.
//!
//! # Message Flow
//!
//! ```text
//! Client                                    Upload service
//! │  UploadFileRequest{metadata}              │
//! │ ─────────────────────────────────────────>│
//! │  UploadFileRequest{chunk} ...             │
//! │ ─────────────────────────────────────────>│
//! │  (half-close)                             │
//! │ ─────────────────────────────────────────>│
//! │       UploadFileResponse{file_id, ...}    │
//! │<───────────────────────────────────────── │
//!
//! Client                                    Download service
//! │  DownloadFileRequest{file_id}             │
//! │ ─────────────────────────────────────────>│
//! │       DownloadFileResponse{metadata}      │
//! │<───────────────────────────────────────── │
//! │       DownloadFileResponse{chunk} ...     │
//! │<───────────────────────────────────────── │
//! ```

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("filexfer.v1");
}

mod client;
mod config;
mod convert;
mod download;
mod server;
mod upload;

pub use client::{ClientError, FileClient};
pub use config::ServerConfig;
pub use convert::{AUTHORIZATION, error_from_status, status_from};
pub use download::DownloadService;
pub use server::{TransferServer, serve};
pub use upload::UploadService;

// Re-export proto types for convenience
pub use proto::{
    file_download_client::FileDownloadClient, file_download_server::FileDownloadServer,
    file_upload_client::FileUploadClient, file_upload_server::FileUploadServer,
};
