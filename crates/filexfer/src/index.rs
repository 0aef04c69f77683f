//! Relational index of file ownership metadata.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::blob::BlobId;

/// Metadata of one completed upload. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Generated id, also the blob key
    pub id: BlobId,
    /// Client-declared file name
    pub filename: String,
    /// Client-declared MIME type
    pub content_type: String,
    /// Bytes actually received
    pub size: u64,
    /// Subject of the principal that uploaded the file
    pub owner: String,
    /// When the upload was finalized
    pub created_at: DateTime<Utc>,
}

/// Errors from the metadata index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// A record with this id already exists
    #[error("duplicate file id: {0}")]
    Conflict(BlobId),
    /// Connectivity or query failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Storage for [`FileRecord`]s.
///
/// Implementations must be safe to share between concurrent calls.
#[async_trait]
pub trait MetadataIndex: Send + Sync + fmt::Debug {
    /// Insert a record. Fails with [`IndexError::Conflict`] if the id exists.
    async fn record(&self, record: &FileRecord) -> Result<(), IndexError>;

    /// Look up a single record.
    async fn get(&self, id: BlobId) -> Result<Option<FileRecord>, IndexError>;

    /// All records owned by `owner`, oldest first. Each call runs a fresh query.
    async fn list_for_owner(&self, owner: &str) -> Result<Vec<FileRecord>, IndexError>;
}

/// SQLite-backed [`MetadataIndex`].
#[derive(Debug, Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    id: String,
    filename: String,
    content_type: String,
    size: i64,
    user_id: String,
    created_at: String,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = IndexError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let id = BlobId::parse(&row.id)
            .ok_or_else(|| IndexError::Corrupt(format!("bad file id {:?}", row.id)))?;
        let size = u64::try_from(row.size)
            .map_err(|_| IndexError::Corrupt(format!("negative size for {id}")))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| IndexError::Corrupt(format!("bad timestamp for {id}: {e}")))?
            .with_timezone(&Utc);
        Ok(FileRecord {
            id,
            filename: row.filename,
            content_type: row.content_type,
            size,
            owner: row.user_id,
            created_at,
        })
    }
}

/// Fixed-width so that textual order matches time order.
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteIndex {
    /// Connect to the database at `url` and create the schema if missing.
    pub async fn connect(url: &str) -> Result<Self, IndexError> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        tracing::info!(url, "metadata index connected");
        Ok(index)
    }

    /// A private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, IndexError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    /// Create the `files` table and its owner index.
    pub async fn migrate(&self) -> Result<(), IndexError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_user_id ON files (user_id, created_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MetadataIndex for SqliteIndex {
    async fn record(&self, record: &FileRecord) -> Result<(), IndexError> {
        let size = i64::try_from(record.size)
            .map_err(|_| IndexError::Corrupt(format!("size out of range for {}", record.id)))?;

        let result = sqlx::query(
            "INSERT INTO files (id, filename, content_type, size, user_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.filename)
        .bind(&record.content_type)
        .bind(size)
        .bind(&record.owner)
        .bind(encode_timestamp(&record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(file_id = %record.id, owner = %record.owner, "file recorded");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(IndexError::Conflict(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: BlobId) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT id, filename, content_type, size, user_id, created_at
             FROM files WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(FileRecord::try_from).transpose()
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<FileRecord>, IndexError> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT id, filename, content_type, size, user_id, created_at
             FROM files WHERE user_id = ? ORDER BY created_at, id",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{SubsecRound, TimeZone};

    use super::*;

    fn record(owner: &str, filename: &str, second: u32) -> FileRecord {
        FileRecord {
            id: BlobId::generate(),
            filename: filename.to_string(),
            content_type: "text/plain".to_string(),
            size: 42,
            owner: owner.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let index = SqliteIndex::in_memory().await.unwrap();
        let mut rec = record("1", "a.txt", 0);
        rec.created_at = Utc::now().trunc_subsecs(6);

        index.record(&rec).await.unwrap();

        assert_eq!(index.get(rec.id).await.unwrap(), Some(rec));
        assert_eq!(index.get(BlobId::generate()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_conflict() {
        let index = SqliteIndex::in_memory().await.unwrap();
        let rec = record("1", "a.txt", 0);

        index.record(&rec).await.unwrap();
        let err = index.record(&rec).await.unwrap_err();

        assert!(matches!(err, IndexError::Conflict(id) if id == rec.id));
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_owner_and_ordered() {
        let index = SqliteIndex::in_memory().await.unwrap();
        let later = record("alice", "later.txt", 30);
        let earlier = record("alice", "earlier.txt", 10);
        let other = record("bob", "bob.txt", 20);

        for rec in [&later, &earlier, &other] {
            index.record(rec).await.unwrap();
        }

        let alice = index.list_for_owner("alice").await.unwrap();
        assert_eq!(alice, vec![earlier.clone(), later.clone()]);

        let bob = index.list_for_owner("bob").await.unwrap();
        assert_eq!(bob, vec![other]);

        // Fresh query each time
        assert_eq!(index.list_for_owner("alice").await.unwrap(), alice);
    }

    #[tokio::test]
    async fn test_list_for_unknown_owner_is_empty() {
        let index = SqliteIndex::in_memory().await.unwrap();
        index.record(&record("alice", "a.txt", 0)).await.unwrap();

        assert!(index.list_for_owner("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("index.db").display());
        let rec = record("7", "kept.bin", 5);

        {
            let index = SqliteIndex::connect(&url).await.unwrap();
            index.record(&rec).await.unwrap();
            index.pool().close().await;
        }

        let reopened = SqliteIndex::connect(&url).await.unwrap();
        assert_eq!(reopened.get(rec.id).await.unwrap(), Some(rec));
    }
}
