//! Copy-status reconciliation
//!
//! Partial copy-status updates travel over an at-least-once queue ([`CopyStatusQueue`])
//! and are folded into the canonical per-upload document by the
//! [`CopyStatusReconciler`] worker pool.

pub mod merge;
pub mod queue;
pub mod reconciler;

pub use merge::{CopyStatusMerger, ReconcileError, ReconcileOutcome};
pub use queue::{
    CopyStatusQueue, Delivery, MemoryCopyStatusQueue, PostgresCopyStatusQueue, QueueError,
};
pub use reconciler::{CopyStatusReconciler, DeliveryOutcome, ReconcilerConfig, ReconcilerHandle};
