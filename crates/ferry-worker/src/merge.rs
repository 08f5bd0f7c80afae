//! Optimistic read-modify-write of copy-status documents.

use ferry_core::models::{Item, ItemCopyStatus, ItemInternalCopyStatus, MergeOutcome, Tguid};
use ferry_core::BackoffPolicy;
use ferry_db::{CopyStatusStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Copy-status message has no tguid")]
    MissingTguid,

    #[error("Gave up on {tguid} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { tguid: Tguid, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Whether the message should be left on the queue for redelivery.
    pub fn is_redeliverable(&self) -> bool {
        match self {
            ReconcileError::MissingTguid => false,
            ReconcileError::ConflictRetriesExhausted { .. } => true,
            ReconcileError::Store(e) => e.is_transient(),
        }
    }
}

/// What one merge did to the stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The document did not exist and was created by this merge
    pub created: bool,
    pub merge: MergeOutcome,
    /// Number of write attempts, 1 when there was no conflict
    pub attempts: u32,
}

/// Applies field-level merges against a [`CopyStatusStore`], re-reading and re-applying
/// the same merge whenever the conditional write loses to a concurrent writer.
#[derive(Clone)]
pub struct CopyStatusMerger {
    store: Arc<dyn CopyStatusStore>,
    conflict_backoff: BackoffPolicy,
}

impl CopyStatusMerger {
    pub fn new(store: Arc<dyn CopyStatusStore>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            conflict_backoff: BackoffPolicy::new(
                max_conflict_retries.saturating_add(1),
                Duration::from_millis(5),
                Duration::from_millis(200),
            ),
        }
    }

    pub fn store(&self) -> &Arc<dyn CopyStatusStore> {
        &self.store
    }

    /// Merge a partial status update into the document for its tguid.
    pub async fn apply(
        &self,
        update: &ItemInternalCopyStatus,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let tguid = update.tguid.as_ref().ok_or(ReconcileError::MissingTguid)?;
        self.read_modify_write(tguid, |doc| doc.merge(update)).await
    }

    /// Record upload metadata on the document, leaving status fields alone.
    ///
    /// Only replaces a placeholder item, so a late seed never clobbers real metadata.
    pub async fn seed_item(&self, item: &Item) -> Result<ReconcileOutcome, ReconcileError> {
        self.read_modify_write(&item.tguid, |doc| MergeOutcome {
            applied: u8::from(doc.adopt_item(item)),
            rejected: 0,
        })
        .await
    }

    async fn read_modify_write<F>(
        &self,
        tguid: &Tguid,
        apply: F,
    ) -> Result<ReconcileOutcome, ReconcileError>
    where
        F: Fn(&mut ItemCopyStatus) -> MergeOutcome,
    {
        let apply = &apply;
        let result = self
            .conflict_backoff
            .retry(
                move |attempt| self.try_write(tguid, apply, attempt),
                |e: &StoreError| {
                    if e.is_conflict() {
                        tracing::debug!(tguid = %tguid, "Copy-status write conflict, re-reading");
                    }
                    e.is_conflict()
                },
            )
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_conflict() => Err(ReconcileError::ConflictRetriesExhausted {
                tguid: tguid.clone(),
                attempts: self.conflict_backoff.max_attempts,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_write<F>(
        &self,
        tguid: &Tguid,
        apply: &F,
        attempt: u32,
    ) -> Result<ReconcileOutcome, StoreError>
    where
        F: Fn(&mut ItemCopyStatus) -> MergeOutcome,
    {
        match self.store.get(tguid).await? {
            None => {
                let mut document = ItemCopyStatus::new(Item::placeholder(tguid));
                let merge = apply(&mut document);
                self.store.insert(&document).await?;
                Ok(ReconcileOutcome {
                    created: true,
                    merge,
                    attempts: attempt,
                })
            }
            Some(current) => {
                let mut document = current.document;
                let merge = apply(&mut document);
                if merge.changed() {
                    self.store.replace(&document, current.revision).await?;
                }
                Ok(ReconcileOutcome {
                    created: false,
                    merge,
                    attempts: attempt,
                })
            }
        }
    }
}
