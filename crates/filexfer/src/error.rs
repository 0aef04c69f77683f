//! Error taxonomy shared by every transfer operation.

use std::fmt;

use thiserror::Error;

use crate::auth::AuthError;
use crate::blob::BlobError;
use crate::index::IndexError;

/// Machine-checkable classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Missing, invalid or expired credential.
    Unauthenticated,
    /// Protocol violation or missing field.
    InvalidArgument,
    /// Unknown file id.
    NotFound,
    /// I/O, database or unexpected state failure.
    Internal,
    /// Duplicate file id.
    Conflict,
    /// A per-chunk or per-call time bound expired.
    DeadlineExceeded,
    /// The peer went away or the call was cancelled.
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Internal => "internal",
            ErrorCode::Conflict => "conflict",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the upload and download protocols.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Credential missing, malformed, forged or expired
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The peer broke the frame protocol
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No blob or record exists for the id
    #[error("not found: {0}")]
    NotFound(String),
    /// Storage or database failure
    #[error("internal error: {0}")]
    Internal(String),
    /// A record with this id already exists
    #[error("conflict: {0}")]
    Conflict(String),
    /// Timed out waiting on the peer
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// The peer disconnected mid-transfer
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl TransferError {
    /// The machine-checkable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransferError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            TransferError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            TransferError::NotFound(_) => ErrorCode::NotFound,
            TransferError::Internal(_) => ErrorCode::Internal,
            TransferError::Conflict(_) => ErrorCode::Conflict,
            TransferError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            TransferError::Cancelled(_) => ErrorCode::Cancelled,
        }
    }

    /// The human-readable part, without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            TransferError::Unauthenticated(m)
            | TransferError::InvalidArgument(m)
            | TransferError::NotFound(m)
            | TransferError::Internal(m)
            | TransferError::Conflict(m)
            | TransferError::DeadlineExceeded(m)
            | TransferError::Cancelled(m) => m,
        }
    }
}

impl From<AuthError> for TransferError {
    fn from(err: AuthError) -> Self {
        TransferError::Unauthenticated(err.to_string())
    }
}

impl From<BlobError> for TransferError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(id) => TransferError::NotFound(format!("file {id} not found")),
            BlobError::Io(e) => TransferError::Internal(format!("blob storage: {e}")),
        }
    }
}

impl From<IndexError> for TransferError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Conflict(id) => TransferError::Conflict(format!("file {id} already exists")),
            IndexError::Database(e) => TransferError::Internal(format!("metadata index: {e}")),
            IndexError::Corrupt(msg) => TransferError::Internal(format!("metadata index: {msg}")),
        }
    }
}

/// Result alias for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_variants() {
        assert_eq!(
            TransferError::NotFound("x".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            TransferError::DeadlineExceeded("x".into()).code(),
            ErrorCode::DeadlineExceeded
        );
        assert_eq!(ErrorCode::InvalidArgument.to_string(), "invalid_argument");
    }

    #[test]
    fn test_message_strips_prefix() {
        let err = TransferError::InvalidArgument("first frame must be metadata".into());
        assert_eq!(err.message(), "first frame must be metadata");
        assert_eq!(
            err.to_string(),
            "invalid argument: first frame must be metadata"
        );
    }

    #[test]
    fn test_auth_errors_are_unauthenticated() {
        let err: TransferError = AuthError::Missing.into();
        assert_eq!(err.code(), ErrorCode::Unauthenticated);
    }

    #[test]
    fn test_blob_not_found_maps_to_not_found() {
        let id = crate::blob::BlobId::generate();
        let err: TransferError = BlobError::NotFound(id).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(err.message().contains(&id.to_string()));
    }
}
