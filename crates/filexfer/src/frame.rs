//! Frames of the streaming transfer protocol.

use chrono::{DateTime, Utc};

use crate::blob::BlobId;
use crate::index::FileRecord;

/// Content type assumed when a client does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Header describing the file carried by a transfer.
///
/// On upload only `filename`, `content_type` and `size` are meaningful; the
/// receiver assigns the id, owner and timestamp. On download every field is
/// populated from the stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    /// Stored file id; absent on upload
    pub id: Option<BlobId>,
    /// File name
    pub filename: String,
    /// MIME type
    pub content_type: String,
    /// Size in bytes. On upload, `0` means not declared.
    pub size: u64,
    /// Owner subject; ignored on upload
    pub owner: String,
    /// Creation time; absent on upload
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&FileRecord> for FileMetadata {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: Some(record.id),
            filename: record.filename.clone(),
            content_type: record.content_type.clone(),
            size: record.size,
            owner: record.owner.clone(),
            created_at: Some(record.created_at),
        }
    }
}

/// One unit of the wire protocol: exactly one of metadata or a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    /// Always the first frame of a transfer
    Metadata(FileMetadata),
    /// A non-empty slice of file content, in byte order
    Chunk(Vec<u8>),
}

impl TransferFrame {
    /// Short name of the variant, for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferFrame::Metadata(_) => "metadata",
            TransferFrame::Chunk(_) => "chunk",
        }
    }
}
