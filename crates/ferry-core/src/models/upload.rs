use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Globally unique upload identifier, minted once per upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tguid(String);

impl Tguid {
    const MAX_LEN: usize = 128;

    pub fn generate() -> Self {
        Tguid(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Tguid {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl FromStr for Tguid {
    type Err = anyhow::Error;

    /// Accepts ASCII alphanumerics, `-` and `_` so the id is safe inside storage keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(anyhow::anyhow!("Invalid tguid length: {}", s.len()));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow::anyhow!("Invalid tguid: {}", s));
        }
        Ok(Tguid(s.to_string()))
    }
}

impl TryFrom<String> for Tguid {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tguid> for String {
    fn from(tguid: Tguid) -> Self {
        tguid.0
    }
}

/// Outcome recorded on a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReceiptStatus {
    Accepted,
    Rejected,
}

impl Display for ReceiptStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ReceiptStatus::Accepted => write!(f, "ACCEPTED"),
            ReceiptStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Returned to the uploading client once the object is sealed. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileReceipt {
    #[schema(value_type = String)]
    pub tguid: Tguid,
    pub etag: String,
    pub status: ReceiptStatus,
}

/// Routing descriptor carried by every upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct RoutingKey {
    pub meta_destination_id: String,
    pub meta_ext_event: String,
}

impl Display for RoutingKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", self.meta_destination_id, self.meta_ext_event)
    }
}

/// Validated client metadata for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UploadMetadata {
    pub routing: RoutingKey,
    pub filename: String,
    /// Every key/value pair the client sent, including the ones lifted above
    pub fields: HashMap<String, String>,
}

impl UploadMetadata {
    pub const DESTINATION_ID: &'static str = "meta_destination_id";
    pub const EXT_EVENT: &'static str = "meta_ext_event";
    pub const FILENAME_KEYS: [&'static str; 2] = ["filename", "original_filename"];
    pub const CONTENT_TYPE_KEYS: [&'static str; 3] = ["filetype", "content_type", "contentType"];
    pub const DEFAULT_CONTENT_TYPE: &'static str = "application/octet-stream";

    /// Lift the routing descriptor and filename out of raw metadata.
    ///
    /// Returns a message naming the first missing or empty field.
    pub fn from_fields(fields: HashMap<String, String>) -> Result<Self, String> {
        let required = |key: &str| -> Result<String, String> {
            match fields.get(key).map(|v| v.trim()) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(format!("Missing required metadata field: {}", key)),
            }
        };
        let meta_destination_id = required(Self::DESTINATION_ID)?;
        let meta_ext_event = required(Self::EXT_EVENT)?;
        let filename = Self::FILENAME_KEYS
            .iter()
            .find_map(|key| required(key).ok())
            .ok_or_else(|| "Missing required metadata field: filename".to_string())?;

        Ok(Self {
            routing: RoutingKey {
                meta_destination_id,
                meta_ext_event,
            },
            filename,
            fields,
        })
    }
}

impl UploadMetadata {
    /// Client-declared media type, falling back to `application/octet-stream`.
    pub fn content_type(&self) -> &str {
        Self::CONTENT_TYPE_KEYS
            .iter()
            .filter_map(|key| self.fields.get(*key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .unwrap_or(Self::DEFAULT_CONTENT_TYPE)
    }
}

/// Lifecycle of one in-progress upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Receiving,
    Completed,
    Abandoned,
}

impl Display for UploadState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadState::Receiving => write!(f, "receiving"),
            UploadState::Completed => write!(f, "completed"),
            UploadState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Progress snapshot served to polling clients
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadInfo {
    #[schema(value_type = String)]
    pub tguid: Tguid,
    pub offset: u64,
    pub length: u64,
    pub state: UploadState,
    pub filename: String,
    pub meta_destination_id: String,
    pub meta_ext_event: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<FileReceipt>,
}

/// Emitted once when an upload is sealed; drives replication.
#[derive(Debug, Clone)]
pub struct UploadCompleted {
    pub tguid: Tguid,
    pub etag: String,
    /// Staging storage key of the assembled object
    pub object_key: String,
    pub size: u64,
    pub metadata: UploadMetadata,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}
