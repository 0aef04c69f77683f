//! The download service: server-streaming file downloads and listings.

use std::pin::{Pin, pin};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use filexfer::{Download, TransferContext};

use crate::convert::{credential, download_response, record_to_proto, status_from};
use crate::proto::{
    self, DownloadFileRequest, DownloadFileResponse, ListFilesRequest, ListFilesResponse,
};

/// Frames buffered ahead of a slow reader.
const DOWNLOAD_BUFFER: usize = 4;

/// gRPC handler for the `FileDownload` service.
#[derive(Clone, Debug)]
pub struct DownloadService {
    ctx: Arc<TransferContext>,
}

impl DownloadService {
    /// Create a service over a shared context.
    pub fn new(ctx: Arc<TransferContext>) -> Self {
        Self { ctx }
    }
}

type DownloadFileStream = Pin<Box<dyn Stream<Item = Result<DownloadFileResponse, Status>> + Send>>;

#[tonic::async_trait]
impl proto::file_download_server::FileDownload for DownloadService {
    type DownloadFileStream = DownloadFileStream;

    async fn download_file(
        &self,
        request: Request<DownloadFileRequest>,
    ) -> Result<Response<Self::DownloadFileStream>, Status> {
        let principal = self
            .ctx
            .authenticate(credential(&request))
            .map_err(status_from)?;
        let file_id = request.into_inner().file_id;

        // Resolve before the stream opens so a miss surfaces as a plain status
        let download = self
            .ctx
            .sender()
            .open(&principal, &file_id)
            .await
            .map_err(status_from)?;

        let (tx, rx) = mpsc::channel(DOWNLOAD_BUFFER);
        let stall = self.ctx.limits().chunk_timeout;
        tokio::spawn(stream_download(download, tx, stall));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as DownloadFileStream))
    }

    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<ListFilesResponse>, Status> {
        let principal = self
            .ctx
            .authenticate(credential(&request))
            .map_err(status_from)?;

        let records = self
            .ctx
            .sender()
            .list_files(&principal)
            .await
            .map_err(status_from)?;
        Ok(Response::new(ListFilesResponse {
            files: records.iter().map(record_to_proto).collect(),
        }))
    }
}

/// Feed one download into the response channel.
///
/// Stops early when the client goes away or stops reading for longer than
/// `stall`; the blob handle is released either way.
async fn stream_download(
    download: Download,
    tx: mpsc::Sender<Result<DownloadFileResponse, Status>>,
    stall: std::time::Duration,
) {
    let file_id = download
        .metadata()
        .id
        .map(|id| id.to_string())
        .unwrap_or_default();
    let mut frames = pin!(download.into_frames());
    let mut sent = 0usize;

    while let Some(frame) = frames.next().await {
        let item = frame.map(download_response).map_err(status_from);
        let failed = item.is_err();
        match tx.send_timeout(item, stall).await {
            Ok(()) => sent += 1,
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(file_id = %file_id, sent, "client stopped reading, abandoning download");
                return;
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!(file_id = %file_id, sent, "client went away mid-download");
                return;
            }
        }
        if failed {
            return;
        }
    }

    tracing::info!(file_id = %file_id, frames = sent, "download complete");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use filexfer::{BlobId, BlobStore, FileRecord, MetadataIndex, Principal, Sender, SqliteIndex};
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::proto::download_file_response::Data;

    const STALL: Duration = Duration::from_millis(20);

    /// A stored 10 byte file served in 4 byte chunks: metadata plus 3 chunks.
    async fn open_download(dir: &tempfile::TempDir) -> Download {
        let blobs = BlobStore::open_dir(dir.path(), 4).await.unwrap();
        let index = SqliteIndex::in_memory().await.unwrap();

        let id = BlobId::generate();
        let mut writer = blobs.create(id).await.unwrap();
        writer.write_chunk(b"0123456789").await.unwrap();
        let size = writer.commit().await.unwrap();
        index
            .record(&FileRecord {
                id,
                filename: "digits.txt".into(),
                content_type: "text/plain".into(),
                size,
                owner: "1".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        Sender::new(&blobs, &index)
            .open(&Principal::new("1"), &id.to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reader_that_stops_reading_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let download = open_download(&dir).await;
        let (tx, mut rx) = mpsc::channel(1);

        tokio::time::timeout(Duration::from_secs(5), stream_download(download, tx, STALL))
            .await
            .unwrap();

        // Only the metadata frame fit; the first chunk timed out
        let first = rx.try_recv().unwrap().unwrap();
        assert!(matches!(first.data, Some(Data::Metadata(_))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn test_closed_receiver_stops_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let download = open_download(&dir).await;
        let (tx, rx) = mpsc::channel(DOWNLOAD_BUFFER);
        drop(rx);

        // A generous stall: returning at all means the closed branch was taken
        tokio::time::timeout(
            Duration::from_secs(5),
            stream_download(download, tx, Duration::from_secs(60)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_drained_reader_gets_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let download = open_download(&dir).await;
        let (tx, rx) = mpsc::channel(1);

        let task = tokio::spawn(stream_download(download, tx, Duration::from_secs(5)));
        let frames: Vec<_> = ReceiverStream::new(rx)
            .map(|r| r.unwrap().data.unwrap())
            .collect()
            .await;
        task.await.unwrap();

        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], Data::Metadata(_)));
        let content: Vec<u8> = frames[1..]
            .iter()
            .flat_map(|d| match d {
                Data::Chunk(c) => c.clone(),
                Data::Metadata(_) => panic!("metadata after the first frame"),
            })
            .collect();
        assert_eq!(content, b"0123456789");
    }
}
