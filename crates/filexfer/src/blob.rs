//! On-disk blob storage keyed by generated file ids.
//!
//! Each blob lives at `<root>/<id>`. Writes are staged in `<root>/<id>.part`
//! and only become visible under the final name on [`BlobWriter::commit`], so
//! a reader never observes a partially received file. Both directions move
//! data one bounded chunk at a time; a whole file is never held in memory.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::limits::DEFAULT_CHUNK_BYTES;

const PARTIAL_SUFFIX: &str = ".part";
const QUARANTINE_DIR: &str = "orphaned";

/// Opaque identifier of a stored file.
///
/// Always a random UUID in canonical hyphenated lowercase form. Parsing
/// rejects every other spelling, which keeps ids safe to use as file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(Uuid);

impl BlobId {
    /// Generate a fresh, unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a canonical id, returning `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let uuid = Uuid::parse_str(s).ok()?;
        let id = Self(uuid);
        (id.to_string() == s).then_some(id)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Errors from blob storage.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No committed blob exists for the id
    #[error("blob not found: {0}")]
    NotFound(BlobId),
    /// Underlying filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Filesystem-backed blob store.
///
/// Safe for concurrent use: each call works on its own id, and the store
/// itself holds no mutable state.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    chunk_bytes: usize,
}

impl BlobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open_dir(root: impl Into<PathBuf>, chunk_bytes: usize) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::info!(root = %root.display(), "blob store opened");
        Ok(Self {
            root,
            chunk_bytes: chunk_bytes.max(1),
        })
    }

    /// Directory holding the blobs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the committed blob for `id`.
    pub fn path_for(&self, id: BlobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn partial_path_for(&self, id: BlobId) -> PathBuf {
        self.root.join(format!("{id}{PARTIAL_SUFFIX}"))
    }

    /// Start a new blob. The sink is exclusively owned by the caller.
    pub async fn create(&self, id: BlobId) -> Result<BlobWriter, BlobError> {
        let target = self.path_for(id);
        if fs::try_exists(&target).await? {
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("blob {id} already exists"),
            )));
        }

        let partial = self.partial_path_for(id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .await?;

        tracing::debug!(file_id = %id, "blob sink created");
        Ok(BlobWriter {
            id,
            file: Some(file),
            partial,
            target,
            written: 0,
            finished: false,
        })
    }

    /// Open a committed blob for sequential reading.
    pub async fn open(&self, id: BlobId) -> Result<BlobReader, BlobError> {
        let file = match File::open(self.path_for(id)).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(BlobError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata().await?;
        Ok(BlobReader {
            id,
            size: meta.len(),
            chunks: ChunkedReader::new(file, self.chunk_bytes),
        })
    }

    /// Whether a committed blob exists for `id`.
    pub async fn exists(&self, id: BlobId) -> Result<bool, BlobError> {
        Ok(fs::try_exists(self.path_for(id)).await?)
    }

    /// Delete a committed blob.
    pub async fn remove(&self, id: BlobId) -> Result<(), BlobError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a committed blob into the `orphaned/` directory under the root.
    ///
    /// The blob no longer lists or opens, but its bytes stay on disk for an
    /// operator to inspect. Returns the new path.
    pub async fn quarantine(&self, id: BlobId) -> Result<PathBuf, BlobError> {
        let dir = self.root.join(QUARANTINE_DIR);
        fs::create_dir_all(&dir).await?;
        let target = dir.join(id.to_string());
        match fs::rename(self.path_for(id), &target).await {
            Ok(()) => Ok(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every committed blob. Unrelated files in the root are ignored.
    pub async fn list(&self) -> Result<Vec<BlobId>, BlobError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(BlobId::parse) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove staged writes left behind by a crash. Returns how many were removed.
    pub async fn sweep_partials(&self) -> Result<usize, BlobError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(PARTIAL_SUFFIX)) else {
                continue;
            };
            if BlobId::parse(stem).is_none() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed > 0 {
            tracing::warn!(removed, "removed partial blobs left by an earlier run");
        }
        Ok(removed)
    }
}

/// Write side of a blob being received.
///
/// Dropping a writer that was never committed removes its staged file.
#[derive(Debug)]
pub struct BlobWriter {
    id: BlobId,
    file: Option<File>,
    partial: PathBuf,
    target: PathBuf,
    written: u64,
    finished: bool,
}

impl BlobWriter {
    /// Id of the blob being written.
    pub fn id(&self) -> BlobId {
        self.id
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append one chunk.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), BlobError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("blob sink already closed"))?;
        file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Flush to stable storage and publish the blob under its final name.
    ///
    /// On failure the staged file is removed.
    pub async fn commit(mut self) -> Result<u64, BlobError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.partial, &self.target).await?;
        self.finished = true;
        tracing::debug!(file_id = %self.id, size = self.written, "blob committed");
        Ok(self.written)
    }

    /// Discard everything written so far.
    pub async fn abort(mut self) {
        drop(self.file.take());
        match fs::remove_file(&self.partial).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file_id = %self.id, error = %e, "failed to remove partial blob");
            }
        }
        self.finished = true;
        tracing::debug!(file_id = %self.id, "partial blob discarded");
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        drop(self.file.take());
        // Last resort when neither commit nor abort ran; abort is the async path
        match std::fs::remove_file(&self.partial) {
            Ok(()) => {
                tracing::warn!(file_id = %self.id, "uncommitted blob dropped, partial file removed");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file_id = %self.id, error = %e, "failed to remove partial blob");
            }
        }
    }
}

/// Read side of a committed blob.
#[derive(Debug)]
pub struct BlobReader {
    id: BlobId,
    size: u64,
    chunks: ChunkedReader<File>,
}

impl BlobReader {
    /// Id of the blob being read.
    pub fn id(&self) -> BlobId {
        self.id
    }

    /// Size on disk when the blob was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Next chunk in byte order, or `None` at end of blob.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.chunks.next_chunk().await?)
    }
}

/// Splits any async byte source into chunks of at most `chunk_bytes`.
///
/// Every chunk except the last is exactly `chunk_bytes` long, so the same
/// input always produces the same boundaries.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    chunk_bytes: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkedReader<R> {
    /// Wrap `inner`. A zero chunk size falls back to the default.
    pub fn new(inner: R, chunk_bytes: usize) -> Self {
        let chunk_bytes = if chunk_bytes == 0 {
            DEFAULT_CHUNK_BYTES
        } else {
            chunk_bytes
        };
        Self {
            inner,
            chunk_bytes,
            done: false,
        }
    }

    /// Read the next chunk, or `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_bytes];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}
