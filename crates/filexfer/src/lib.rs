//! filexfer: chunked, metadata-first file transfer
//!
//! The protocol shared by the upload and download services. A transfer is a
//! stream of [`TransferFrame`]s: exactly one metadata frame, then the file
//! content as bounded chunks in byte order. Uploads flow client to server
//! through the [`Receiver`]; downloads flow server to client through the
//! [`Sender`]. Content lives in the [`BlobStore`], ownership metadata in a
//! [`MetadataIndex`], and every call is authenticated by the
//! [`Authenticator`] before any frame is read or written.
//!
//! Transport concerns (gRPC, metadata headers, status codes) live in the
//! `filexfer-grpc` crate.

mod auth;
mod blob;
mod context;
mod error;
mod frame;
mod index;
mod limits;
mod receiver;
mod sender;

pub use auth::{AuthError, Authenticator, Principal};
pub use blob::{BlobError, BlobId, BlobReader, BlobStore, BlobWriter, ChunkedReader};
pub use context::{RecoveryReport, TransferContext};
pub use error::{ErrorCode, TransferError, TransferResult};
pub use frame::{DEFAULT_CONTENT_TYPE, FileMetadata, TransferFrame};
pub use index::{FileRecord, IndexError, MetadataIndex, SqliteIndex};
pub use limits::{DEFAULT_CHUNK_BYTES, TransferLimits};
pub use receiver::Receiver;
pub use sender::{Download, Sender};
