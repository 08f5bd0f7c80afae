//! Resumable upload protocol constants

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation";

pub const HEADER_TUS_RESUMABLE: &str = "tus-resumable";
pub const HEADER_TUS_VERSION: &str = "tus-version";
pub const HEADER_TUS_MAX_SIZE: &str = "tus-max-size";
pub const HEADER_TUS_EXTENSION: &str = "tus-extension";
pub const HEADER_UPLOAD_OFFSET: &str = "upload-offset";
pub const HEADER_UPLOAD_LENGTH: &str = "upload-length";
pub const HEADER_UPLOAD_METADATA: &str = "upload-metadata";
pub const HEADER_TGUID: &str = "tguid";

/// Mount point of the resumable upload endpoints
pub const FILES_PATH: &str = "/files";
