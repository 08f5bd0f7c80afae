//! Ferry Storage Library
//!
//! Blob storage abstraction used by the staging area that holds in-progress uploads and
//! by every replication destination store.
//!
//! # Storage key format
//!
//! - **Staged chunk parts**: `staging/{tguid}/part-{offset}`
//! - **Sealed objects**: `objects/{tguid}`
//! - **Destination copies**: `{destination}-{ext_event}/{tguid}`
//!
//! Keys must not contain `..` or a leading `/`.

pub mod factory;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use factory::{create_storage, StorageTarget};
pub use ferry_core::StorageBackend;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{ByteReader, ByteStream, Storage, StorageError, StorageResult};
