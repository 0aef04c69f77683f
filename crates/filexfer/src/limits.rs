//! Transfer limits

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire chunk size and the upper bound on a single chunk payload.
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

/// Bounds applied to every transfer call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLimits {
    /// Maximum payload of one chunk frame, and the read buffer size for downloads
    pub max_chunk_bytes: usize,
    /// Longest wait for the next frame (inbound) or for room to send one (outbound)
    #[serde(with = "duration_ms")]
    pub chunk_timeout: Duration,
    /// Wall-clock bound on the receive phase of an upload
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_CHUNK_BYTES,
            chunk_timeout: Duration::from_secs(30),  // 30 seconds per frame
            call_timeout: Duration::from_secs(3600), // 1 hour per upload
        }
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
