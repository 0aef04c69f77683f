//! Process-wide handles shared by every call.

use std::sync::Arc;

use crate::auth::{Authenticator, Principal};
use crate::blob::BlobStore;
use crate::error::TransferResult;
use crate::index::MetadataIndex;
use crate::limits::TransferLimits;
use crate::receiver::Receiver;
use crate::sender::Sender;

/// Everything a transfer call needs, built once at startup.
///
/// Cheap to clone; the services hold one behind an `Arc` and hand out
/// borrowing [`Receiver`]s and [`Sender`]s per call.
#[derive(Debug, Clone)]
pub struct TransferContext {
    authenticator: Authenticator,
    blobs: BlobStore,
    index: Arc<dyn MetadataIndex>,
    limits: TransferLimits,
}

/// Outcome of [`TransferContext::recover`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Staged writes from interrupted uploads
    pub partials_removed: usize,
    /// Committed blobs without a record, moved aside
    pub orphans_quarantined: usize,
    /// Unrecorded blobs kept in place because the index held none of them
    pub orphans_left: usize,
}

impl TransferContext {
    /// Assemble a context from its parts.
    pub fn new(
        authenticator: Authenticator,
        blobs: BlobStore,
        index: Arc<dyn MetadataIndex>,
        limits: TransferLimits,
    ) -> Self {
        Self {
            authenticator,
            blobs,
            index,
            limits,
        }
    }

    /// The blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// The metadata index.
    pub fn index(&self) -> &dyn MetadataIndex {
        self.index.as_ref()
    }

    /// Limits applied to each call.
    pub fn limits(&self) -> &TransferLimits {
        &self.limits
    }

    /// Verify the credential attached to a call.
    pub fn authenticate(&self, credential: Option<&str>) -> TransferResult<Principal> {
        let principal = self.authenticator.authenticate(credential)?;
        tracing::trace!(subject = %principal, "call authenticated");
        Ok(principal)
    }

    /// Upload protocol bound to this context.
    pub fn receiver(&self) -> Receiver<'_> {
        Receiver::new(&self.blobs, self.index.as_ref(), &self.limits)
    }

    /// Download protocol bound to this context.
    pub fn sender(&self) -> Sender<'_> {
        Sender::new(&self.blobs, self.index.as_ref())
    }

    /// Bring the blob store back in line with the index after a crash.
    ///
    /// Removes staged writes and moves committed blobs without a record into
    /// the store's `orphaned/` directory. When no stored blob has a record the
    /// index is taken to be the wrong one and the orphan pass is skipped.
    /// Must run before any upload is accepted.
    pub async fn recover(&self) -> TransferResult<RecoveryReport> {
        let partials_removed = self.blobs.sweep_partials().await?;

        let stored = self.blobs.list().await?;
        let mut unrecorded = Vec::new();
        for &id in &stored {
            if self.index.get(id).await?.is_none() {
                unrecorded.push(id);
            }
        }

        let mut report = RecoveryReport {
            partials_removed,
            ..RecoveryReport::default()
        };
        if !unrecorded.is_empty() && unrecorded.len() == stored.len() {
            tracing::warn!(
                blobs = stored.len(),
                "no stored blob has a metadata record; index may be new or mismatched, leaving blobs in place"
            );
            report.orphans_left = unrecorded.len();
        } else {
            for id in unrecorded {
                let moved = self.blobs.quarantine(id).await?;
                tracing::warn!(
                    file_id = %id,
                    path = %moved.display(),
                    "quarantined blob with no metadata record"
                );
                report.orphans_quarantined += 1;
            }
        }

        tracing::info!(
            partials_removed = report.partials_removed,
            orphans_quarantined = report.orphans_quarantined,
            orphans_left = report.orphans_left,
            "storage recovery finished"
        );
        Ok(report)
    }
}
