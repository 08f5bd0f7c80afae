//! Ferry persistence layer
//!
//! Two document families are owned here: the append-only trace of pipeline spans per
//! upload, and the reconciled per-upload copy-status document. Each has a trait with a
//! PostgreSQL implementation and an in-memory implementation used when no database is
//! configured and in tests.

pub mod copy_status;
pub mod error;
pub mod pool;
pub mod trace;

pub use copy_status::{
    CopyStatusStore, MemoryCopyStatusStore, PostgresCopyStatusStore, Versioned,
};
pub use error::StoreError;
pub use pool::{connect, run_migrations, shared_pool};
pub use trace::{MemoryTraceStore, PostgresTraceStore, TraceStore};
