//! Upload side of the transfer protocol.
//!
//! ```text
//! AwaitingMetadata ──metadata──> ReceivingChunks ──end of input──> Finalizing ──> Done
//!        │                          │   ▲ chunk                      │
//!        └──────────────────────────┴───┴────────────────────────────┴──> Failed
//! ```
//!
//! Every path into `Failed` that holds a blob sink goes through
//! [`Receiver::abandon`], which removes the partial file. A failure to record
//! metadata after the blob is committed removes the committed blob, so a
//! record never exists without its blob or the other way round.

use chrono::{SubsecRound, Utc};
use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::auth::Principal;
use crate::blob::{BlobId, BlobStore, BlobWriter};
use crate::error::{TransferError, TransferResult};
use crate::frame::{DEFAULT_CONTENT_TYPE, FileMetadata, TransferFrame};
use crate::index::{FileRecord, IndexError, MetadataIndex};
use crate::limits::TransferLimits;

/// Protocol state of one upload call.
#[derive(Debug)]
enum State {
    AwaitingMetadata,
    ReceivingChunks(InFlight),
    Finalizing(InFlight),
    Done(FileRecord),
    Failed(TransferError),
}

/// An upload past its metadata frame.
#[derive(Debug)]
struct InFlight {
    metadata: FileMetadata,
    sink: BlobWriter,
}

impl InFlight {
    fn id(&self) -> BlobId {
        self.sink.id()
    }
}

/// Reconstructs uploaded files from a stream of frames.
#[derive(Debug)]
pub struct Receiver<'a> {
    blobs: &'a BlobStore,
    index: &'a dyn MetadataIndex,
    limits: &'a TransferLimits,
}

impl<'a> Receiver<'a> {
    /// Create a receiver over the given storage.
    pub fn new(
        blobs: &'a BlobStore,
        index: &'a dyn MetadataIndex,
        limits: &'a TransferLimits,
    ) -> Self {
        Self {
            blobs,
            index,
            limits,
        }
    }

    /// Drive one upload to completion.
    ///
    /// `frames` yields the inbound frames in order; its end marks a graceful
    /// close by the sender, while an `Err` item aborts the upload with that
    /// error. Returns the stored record once blob and metadata are both
    /// persisted.
    pub async fn receive<S>(&self, principal: &Principal, mut frames: S) -> TransferResult<FileRecord>
    where
        S: Stream<Item = TransferResult<TransferFrame>> + Unpin,
    {
        let deadline = Instant::now() + self.limits.call_timeout;
        let mut state = State::AwaitingMetadata;

        loop {
            state = match state {
                State::AwaitingMetadata => self.await_metadata(&mut frames, deadline).await,
                State::ReceivingChunks(upload) => {
                    self.receive_chunk(upload, &mut frames, deadline).await
                }
                State::Finalizing(upload) => self.finalize(upload, principal).await,
                State::Done(record) => return Ok(record),
                State::Failed(err) => {
                    tracing::warn!(owner = %principal, error = %err, "upload failed");
                    return Err(err);
                }
            };
        }
    }

    async fn next_frame<S>(
        &self,
        frames: &mut S,
        deadline: Instant,
    ) -> TransferResult<Option<TransferFrame>>
    where
        S: Stream<Item = TransferResult<TransferFrame>> + Unpin,
    {
        let wait_until = (Instant::now() + self.limits.chunk_timeout).min(deadline);
        match tokio::time::timeout_at(wait_until, frames.next()).await {
            Ok(Some(frame)) => frame.map(Some),
            Ok(None) => Ok(None),
            Err(_) if wait_until == deadline => Err(TransferError::DeadlineExceeded(
                "upload exceeded the call time limit".to_string(),
            )),
            Err(_) => Err(TransferError::DeadlineExceeded(
                "no frame received within the chunk time limit".to_string(),
            )),
        }
    }

    async fn await_metadata<S>(&self, frames: &mut S, deadline: Instant) -> State
    where
        S: Stream<Item = TransferResult<TransferFrame>> + Unpin,
    {
        let metadata = match self.next_frame(frames, deadline).await {
            Ok(Some(TransferFrame::Metadata(metadata))) => metadata,
            Ok(Some(TransferFrame::Chunk(_))) => {
                return State::Failed(TransferError::InvalidArgument(
                    "first message must contain metadata".to_string(),
                ));
            }
            Ok(None) => {
                return State::Failed(TransferError::InvalidArgument(
                    "stream closed before metadata".to_string(),
                ));
            }
            Err(e) => return State::Failed(e),
        };

        let metadata = match validate_metadata(metadata) {
            Ok(m) => m,
            Err(e) => return State::Failed(e),
        };

        let id = BlobId::generate();
        match self.blobs.create(id).await {
            Ok(sink) => {
                tracing::debug!(
                    file_id = %id,
                    filename = %metadata.filename,
                    declared_size = metadata.size,
                    "receiving upload"
                );
                State::ReceivingChunks(InFlight { metadata, sink })
            }
            Err(e) => {
                tracing::error!(file_id = %id, error = %e, "failed to create blob");
                State::Failed(TransferError::Internal("failed to create file".to_string()))
            }
        }
    }

    async fn receive_chunk<S>(&self, mut upload: InFlight, frames: &mut S, deadline: Instant) -> State
    where
        S: Stream<Item = TransferResult<TransferFrame>> + Unpin,
    {
        let data = match self.next_frame(frames, deadline).await {
            Ok(Some(TransferFrame::Chunk(data))) => data,
            Ok(Some(TransferFrame::Metadata(_))) => {
                return self
                    .abandon(
                        upload,
                        TransferError::InvalidArgument(
                            "metadata frame after transfer started".to_string(),
                        ),
                    )
                    .await;
            }
            Ok(None) => return State::Finalizing(upload),
            Err(e) => return self.abandon(upload, e).await,
        };

        if data.is_empty() {
            return self
                .abandon(
                    upload,
                    TransferError::InvalidArgument("empty chunk".to_string()),
                )
                .await;
        }
        if data.len() > self.limits.max_chunk_bytes {
            let err = TransferError::InvalidArgument(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                data.len(),
                self.limits.max_chunk_bytes
            ));
            return self.abandon(upload, err).await;
        }

        let declared = upload.metadata.size;
        let total = upload.sink.written() + data.len() as u64;
        if declared != 0 && total > declared {
            let err = TransferError::InvalidArgument(format!(
                "received more than the declared {declared} bytes"
            ));
            return self.abandon(upload, err).await;
        }

        if let Err(e) = upload.sink.write_chunk(&data).await {
            tracing::error!(file_id = %upload.id(), error = %e, "failed to write chunk");
            return self
                .abandon(
                    upload,
                    TransferError::Internal("failed to write chunk".to_string()),
                )
                .await;
        }

        State::ReceivingChunks(upload)
    }

    async fn finalize(&self, upload: InFlight, principal: &Principal) -> State {
        let declared = upload.metadata.size;
        let received = upload.sink.written();
        if declared != 0 && received != declared {
            let err = TransferError::InvalidArgument(format!(
                "declared {declared} bytes but received {received}"
            ));
            return self.abandon(upload, err).await;
        }

        let InFlight { metadata, sink } = upload;
        let id = sink.id();
        let size = match sink.commit().await {
            Ok(size) => size,
            Err(e) => {
                tracing::error!(file_id = %id, error = %e, "failed to commit blob");
                return State::Failed(TransferError::Internal("failed to store file".to_string()));
            }
        };

        let record = FileRecord {
            id,
            filename: metadata.filename,
            content_type: metadata.content_type,
            size,
            owner: principal.subject().to_string(),
            created_at: Utc::now().trunc_subsecs(6),
        };

        match self.index.record(&record).await {
            Ok(()) => {
                tracing::info!(
                    file_id = %record.id,
                    owner = %record.owner,
                    filename = %record.filename,
                    size = record.size,
                    "upload complete"
                );
                State::Done(record)
            }
            Err(e) => {
                tracing::error!(file_id = %id, error = %e, "failed to save file metadata");
                if let Err(rm) = self.blobs.remove(id).await {
                    tracing::error!(file_id = %id, error = %rm, "failed to remove orphaned blob");
                }
                let err = match e {
                    IndexError::Conflict(_) => TransferError::from(e),
                    _ => TransferError::Internal("failed to save file metadata".to_string()),
                };
                State::Failed(err)
            }
        }
    }

    async fn abandon(&self, upload: InFlight, err: TransferError) -> State {
        tracing::debug!(
            file_id = %upload.id(),
            received = upload.sink.written(),
            error = %err,
            "abandoning upload"
        );
        upload.sink.abort().await;
        State::Failed(err)
    }
}

fn validate_metadata(mut metadata: FileMetadata) -> TransferResult<FileMetadata> {
    metadata.filename = metadata.filename.trim().to_string();
    if metadata.filename.is_empty() {
        return Err(TransferError::InvalidArgument(
            "metadata must include a filename".to_string(),
        ));
    }

    metadata.content_type = metadata.content_type.trim().to_string();
    if metadata.content_type.is_empty() {
        metadata.content_type = DEFAULT_CONTENT_TYPE.to_string();
    }

    Ok(metadata)
}
