pub mod copy_status;
pub mod item;
pub mod trace;
pub mod upload;

pub use copy_status::{CopyStatus, Destination};
pub use item::{Item, ItemCopyStatus, ItemInternalCopyStatus, MergeOutcome};
pub use trace::{Span, SpanStatus, Trace, TraceContext, STAGE_UPLOAD_RECEIVED};
pub use upload::{
    FileReceipt, ReceiptStatus, RoutingKey, Tguid, UploadCompleted, UploadInfo, UploadMetadata,
    UploadState,
};
