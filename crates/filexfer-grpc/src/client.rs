//! Client for the upload and download services.

use std::io;
use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Code, Request, Status};

use filexfer::{ChunkedReader, DEFAULT_CHUNK_BYTES, DEFAULT_CONTENT_TYPE};

use crate::convert::AUTHORIZATION;
use crate::proto::{
    self, DownloadFileRequest, GetFileMetadataRequest, ListFilesRequest, UploadFileRequest,
    UploadFileResponse, download_file_response::Data as DownloadData,
    file_download_client::FileDownloadClient, file_upload_client::FileUploadClient,
    upload_file_request::Data as UploadData,
};

/// Errors from [`FileClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach a service
    #[error("connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),

    /// The server rejected the call
    #[error("{}: {}", .0.code(), .0.message())]
    Status(#[from] Status),

    /// Local file I/O failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server sent a stream that breaks the frame ordering
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The token cannot be carried in a header
    #[error("token is not a valid header value")]
    Token,
}

impl ClientError {
    /// The gRPC code, when the server rejected the call.
    pub fn code(&self) -> Option<Code> {
        match self {
            ClientError::Status(status) => Some(status.code()),
            _ => None,
        }
    }
}

/// Authenticated handle on both services.
#[derive(Debug, Clone)]
pub struct FileClient {
    upload: FileUploadClient<Channel>,
    download: FileDownloadClient<Channel>,
    authorization: MetadataValue<Ascii>,
}

impl FileClient {
    /// Connect to both services, attaching `token` to every call.
    pub async fn connect(
        upload_endpoint: impl Into<String>,
        download_endpoint: impl Into<String>,
        token: &str,
    ) -> Result<Self, ClientError> {
        let authorization: MetadataValue<Ascii> = format!("Bearer {token}")
            .parse()
            .map_err(|_| ClientError::Token)?;
        let upload = FileUploadClient::connect(upload_endpoint.into()).await?;
        let download = FileDownloadClient::connect(download_endpoint.into()).await?;
        Ok(Self {
            upload,
            download,
            authorization,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(AUTHORIZATION, self.authorization.clone());
        request
    }

    /// Upload a local file under its own name.
    ///
    /// The size is declared up front so a file that changes mid-upload is
    /// rejected by the server.
    pub async fn upload_file(
        &mut self,
        path: &Path,
        content_type: Option<&str>,
    ) -> Result<UploadFileResponse, ClientError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

        let metadata = proto::FileMetadata {
            filename,
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
            size: i64::try_from(size).unwrap_or(i64::MAX),
            ..Default::default()
        };
        self.upload_reader(metadata, file).await
    }

    /// Upload an in-memory buffer.
    pub async fn upload_bytes(
        &mut self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadFileResponse, ClientError> {
        let metadata = proto::FileMetadata {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size: i64::try_from(data.len()).unwrap_or(i64::MAX),
            ..Default::default()
        };
        self.upload_reader(metadata, io::Cursor::new(data)).await
    }

    /// Upload everything `reader` yields, preceded by `metadata`.
    ///
    /// A read error cancels the call, so the server discards the partial
    /// upload instead of storing a truncated file.
    pub async fn upload_reader<R>(
        &mut self,
        metadata: proto::FileMetadata,
        reader: R,
    ) -> Result<UploadFileResponse, ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(4);
        let (failed_tx, failed_rx) = oneshot::channel::<io::Error>();

        tokio::spawn(async move {
            let first = UploadFileRequest {
                data: Some(UploadData::Metadata(metadata)),
            };
            if tx.send(first).await.is_err() {
                return;
            }
            let mut chunks = ChunkedReader::new(reader, DEFAULT_CHUNK_BYTES);
            loop {
                match chunks.next_chunk().await {
                    Ok(Some(chunk)) => {
                        let msg = UploadFileRequest {
                            data: Some(UploadData::Chunk(chunk)),
                        };
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = failed_tx.send(e);
                        // Keep the stream open until the call is dropped
                        tx.closed().await;
                        return;
                    }
                }
            }
        });

        let request = self.request(ReceiverStream::new(rx));
        let mut upload = self.upload.clone();
        tokio::select! {
            response = upload.upload_file(request) => Ok(response?.into_inner()),
            Ok(e) = failed_rx => Err(ClientError::Io(e)),
        }
    }

    /// Stream a stored file into `writer` and return its metadata frame.
    pub async fn download_to<W>(
        &mut self,
        file_id: &str,
        writer: &mut W,
    ) -> Result<proto::FileMetadata, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let request = self.request(DownloadFileRequest {
            file_id: file_id.to_string(),
        });
        let mut stream = self.download.download_file(request).await?.into_inner();

        let mut metadata: Option<proto::FileMetadata> = None;
        let mut received = 0u64;
        while let Some(msg) = stream.message().await? {
            match (msg.data, metadata.is_some()) {
                (Some(DownloadData::Metadata(m)), false) => metadata = Some(m),
                (Some(DownloadData::Metadata(_)), true) => {
                    return Err(ClientError::Protocol("duplicate metadata frame".into()));
                }
                (Some(DownloadData::Chunk(_)), false) => {
                    return Err(ClientError::Protocol("chunk before metadata".into()));
                }
                (Some(DownloadData::Chunk(chunk)), true) => {
                    writer.write_all(&chunk).await?;
                    received += chunk.len() as u64;
                }
                (None, _) => return Err(ClientError::Protocol("empty frame".into())),
            }
        }
        writer.flush().await?;

        let metadata =
            metadata.ok_or_else(|| ClientError::Protocol("stream ended without metadata".into()))?;
        if u64::try_from(metadata.size).ok() != Some(received) {
            return Err(ClientError::Protocol(format!(
                "expected {} bytes, received {}",
                metadata.size, received
            )));
        }
        Ok(metadata)
    }

    /// Download a stored file to `out`. A failed download leaves no file.
    pub async fn download_file(
        &mut self,
        file_id: &str,
        out: &Path,
    ) -> Result<proto::FileMetadata, ClientError> {
        let mut file = tokio::fs::File::create(out).await?;
        match self.download_to(file_id, &mut file).await {
            Ok(metadata) => {
                file.sync_all().await?;
                Ok(metadata)
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(out).await;
                Err(e)
            }
        }
    }

    /// Download a stored file into memory.
    pub async fn download_bytes(
        &mut self,
        file_id: &str,
    ) -> Result<(proto::FileMetadata, Vec<u8>), ClientError> {
        let mut data = Vec::new();
        let metadata = self.download_to(file_id, &mut data).await?;
        Ok((metadata, data))
    }

    /// Files owned by the caller.
    pub async fn list_files(&mut self) -> Result<Vec<proto::FileMetadata>, ClientError> {
        let request = self.request(ListFilesRequest {});
        Ok(self.download.list_files(request).await?.into_inner().files)
    }

    /// Metadata of one stored file.
    pub async fn get_metadata(&mut self, file_id: &str) -> Result<proto::FileMetadata, ClientError> {
        let request = self.request(GetFileMetadataRequest {
            file_id: file_id.to_string(),
        });
        Ok(self.upload.get_file_metadata(request).await?.into_inner())
    }
}
