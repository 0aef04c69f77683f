//! Conversion between wire messages and transfer types.

use chrono::{DateTime, SecondsFormat, Utc};
use tonic::{Code, Request, Status};

use filexfer::{BlobId, FileMetadata, FileRecord, TransferError, TransferFrame, TransferResult};

use crate::proto::{
    self, DownloadFileResponse, UploadFileRequest, UploadFileResponse,
    download_file_response::Data as DownloadData, upload_file_request::Data as UploadData,
};

/// Metadata key carrying the bearer credential.
pub const AUTHORIZATION: &str = "authorization";

/// The raw credential attached to a call, if any.
pub fn credential<T>(request: &Request<T>) -> Option<&str> {
    request
        .metadata()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Map a transfer error onto the matching gRPC status.
pub fn status_from(err: TransferError) -> Status {
    let code = match &err {
        TransferError::Unauthenticated(_) => Code::Unauthenticated,
        TransferError::InvalidArgument(_) => Code::InvalidArgument,
        TransferError::NotFound(_) => Code::NotFound,
        TransferError::Internal(_) => Code::Internal,
        TransferError::Conflict(_) => Code::AlreadyExists,
        TransferError::DeadlineExceeded(_) => Code::DeadlineExceeded,
        TransferError::Cancelled(_) => Code::Cancelled,
    };
    Status::new(code, err.message())
}

/// Map a gRPC status back onto the transfer taxonomy.
///
/// Used for errors on an inbound stream, where anything unexpected means the
/// peer went away mid-transfer.
pub fn error_from_status(status: &Status) -> TransferError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unauthenticated => TransferError::Unauthenticated(message),
        Code::InvalidArgument | Code::OutOfRange => TransferError::InvalidArgument(message),
        Code::NotFound => TransferError::NotFound(message),
        Code::AlreadyExists => TransferError::Conflict(message),
        Code::DeadlineExceeded => TransferError::DeadlineExceeded(message),
        Code::Cancelled | Code::Unknown | Code::Unavailable | Code::Aborted => {
            TransferError::Cancelled(format!("stream interrupted: {message}"))
        }
        _ => TransferError::Internal(message),
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn size_to_wire(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Wire form of a download metadata frame.
pub fn metadata_to_proto(metadata: &FileMetadata) -> proto::FileMetadata {
    proto::FileMetadata {
        file_id: metadata.id.map(|id| id.to_string()).unwrap_or_default(),
        filename: metadata.filename.clone(),
        content_type: metadata.content_type.clone(),
        size: size_to_wire(metadata.size),
        created_at: metadata
            .created_at
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_default(),
        user_id: metadata.owner.clone(),
    }
}

/// Wire form of a stored record.
pub fn record_to_proto(record: &FileRecord) -> proto::FileMetadata {
    metadata_to_proto(&FileMetadata::from(record))
}

/// Completion reply for a finished upload.
pub fn upload_response(record: &FileRecord) -> UploadFileResponse {
    UploadFileResponse {
        file_id: record.id.to_string(),
        filename: record.filename.clone(),
        size: size_to_wire(record.size),
        created_at: format_timestamp(&record.created_at),
        user_id: record.owner.clone(),
    }
}

/// Decode an inbound metadata message. Id and timestamp are optional.
pub fn metadata_from_proto(metadata: proto::FileMetadata) -> TransferResult<FileMetadata> {
    let size = u64::try_from(metadata.size).map_err(|_| {
        TransferError::InvalidArgument(format!("negative file size {}", metadata.size))
    })?;
    let created_at = match metadata.created_at.as_str() {
        "" => None,
        s => Some(
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| TransferError::InvalidArgument(format!("bad created_at: {e}")))?
                .with_timezone(&Utc),
        ),
    };
    Ok(FileMetadata {
        id: BlobId::parse(&metadata.file_id),
        filename: metadata.filename,
        content_type: metadata.content_type,
        size,
        owner: metadata.user_id,
        created_at,
    })
}

/// Decode one upload message into a frame.
pub fn frame_from_upload(request: UploadFileRequest) -> TransferResult<TransferFrame> {
    match request.data {
        Some(UploadData::Metadata(metadata)) => {
            metadata_from_proto(metadata).map(TransferFrame::Metadata)
        }
        Some(UploadData::Chunk(chunk)) => Ok(TransferFrame::Chunk(chunk)),
        None => Err(TransferError::InvalidArgument(
            "upload message carries neither metadata nor chunk".to_string(),
        )),
    }
}

/// Encode one download frame.
pub fn download_response(frame: TransferFrame) -> DownloadFileResponse {
    let data = match frame {
        TransferFrame::Metadata(metadata) => DownloadData::Metadata(metadata_to_proto(&metadata)),
        TransferFrame::Chunk(chunk) => DownloadData::Chunk(chunk),
    };
    DownloadFileResponse { data: Some(data) }
}
