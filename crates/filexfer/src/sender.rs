//! Download side of the transfer protocol.

use futures::Stream;
use futures::stream;

use crate::auth::Principal;
use crate::blob::{BlobId, BlobReader, BlobStore};
use crate::error::{TransferError, TransferResult};
use crate::frame::{FileMetadata, TransferFrame};
use crate::index::{FileRecord, MetadataIndex};

/// Serves stored files and their metadata.
#[derive(Debug)]
pub struct Sender<'a> {
    blobs: &'a BlobStore,
    index: &'a dyn MetadataIndex,
}

/// An opened download: the metadata frame plus the blob to stream after it.
#[derive(Debug)]
pub struct Download {
    metadata: FileMetadata,
    reader: BlobReader,
}

fn not_found(file_id: &str) -> TransferError {
    TransferError::NotFound(format!("file {file_id} not found"))
}

impl<'a> Sender<'a> {
    /// Create a sender over the given storage.
    pub fn new(blobs: &'a BlobStore, index: &'a dyn MetadataIndex) -> Self {
        Self { blobs, index }
    }

    /// Resolve `file_id` to a stored file ready to stream.
    ///
    /// Fails with `NotFound` when the id is malformed, when no blob exists,
    /// or when the blob has no record yet. Nothing is emitted in that case.
    ///
    /// The metadata frame describes the stored file, not the call: `owner` is
    /// the uploader even when someone else downloads, and `created_at` is the
    /// upload time from the index. Only `size` is read from the blob on disk.
    pub async fn open(&self, principal: &Principal, file_id: &str) -> TransferResult<Download> {
        let id = BlobId::parse(file_id).ok_or_else(|| not_found(file_id))?;
        let reader = self.blobs.open(id).await?;
        let record = self.lookup(id).await?.ok_or_else(|| not_found(file_id))?;

        tracing::debug!(
            file_id = %id,
            caller = %principal,
            owner = %record.owner,
            size = reader.size(),
            "download opened"
        );

        let metadata = FileMetadata {
            size: reader.size(),
            ..FileMetadata::from(&record)
        };
        Ok(Download { metadata, reader })
    }

    /// Metadata of one stored file.
    pub async fn metadata(&self, principal: &Principal, file_id: &str) -> TransferResult<FileRecord> {
        let id = BlobId::parse(file_id).ok_or_else(|| not_found(file_id))?;
        let record = self.lookup(id).await?.ok_or_else(|| not_found(file_id))?;
        tracing::debug!(file_id = %id, caller = %principal, "metadata resolved");
        Ok(record)
    }

    /// Every file owned by the caller. An empty list is not an error.
    pub async fn list_files(&self, principal: &Principal) -> TransferResult<Vec<FileRecord>> {
        let records = self
            .index
            .list_for_owner(principal.subject())
            .await
            .map_err(|e| {
                tracing::error!(owner = %principal, error = %e, "failed to query files");
                TransferError::Internal("failed to query files".to_string())
            })?;
        tracing::debug!(owner = %principal, count = records.len(), "files listed");
        Ok(records)
    }

    async fn lookup(&self, id: BlobId) -> TransferResult<Option<FileRecord>> {
        self.index.get(id).await.map_err(|e| {
            tracing::error!(file_id = %id, error = %e, "failed to read file metadata");
            TransferError::Internal("failed to read file metadata".to_string())
        })
    }
}

impl Download {
    /// The metadata frame that opens the stream.
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// The full frame sequence: one metadata frame, then the blob's chunks in
    /// byte order. A read error ends the stream after yielding it.
    pub fn into_frames(self) -> impl Stream<Item = TransferResult<TransferFrame>> + Send + 'static {
        let Download { metadata, reader } = self;
        stream::unfold(
            Some((Some(metadata), reader)),
            |state| async move {
                let (metadata, mut reader) = state?;
                if let Some(metadata) = metadata {
                    return Some((Ok(TransferFrame::Metadata(metadata)), Some((None, reader))));
                }
                match reader.next_chunk().await {
                    Ok(Some(chunk)) => Some((Ok(TransferFrame::Chunk(chunk)), Some((None, reader)))),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::error!(file_id = %reader.id(), error = %e, "failed to read file");
                        Some((
                            Err(TransferError::Internal("failed to read file".to_string())),
                            None,
                        ))
                    }
                }
            },
        )
    }
}
