use crate::models::upload::{Tguid, UploadMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

/// Stage names emitted by the upload side of the pipeline
pub const STAGE_UPLOAD_RECEIVED: &str = "upload-received";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Success,
    Failure,
}

impl Display for SpanStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            SpanStatus::Success => write!(f, "success"),
            SpanStatus::Failure => write!(f, "failure"),
        }
    }
}

/// One timestamped record of a single pipeline stage's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: SpanStatus,
    pub elapsed_millis: u64,
}

impl Span {
    /// Span for a stage that started `elapsed` ago and finished now.
    pub fn finished(stage_name: impl Into<String>, status: SpanStatus, elapsed: Duration) -> Self {
        Self {
            stage_name: stage_name.into(),
            timestamp: Utc::now(),
            status,
            elapsed_millis: elapsed.as_millis().min(u64::MAX as u128) as u64,
        }
    }
}

/// Identity shared by every span of one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub upload_id: Tguid,
    pub destination_id: String,
    pub event_type: String,
}

impl TraceContext {
    pub fn for_upload(upload_id: &Tguid, metadata: &UploadMetadata) -> Self {
        Self {
            upload_id: upload_id.clone(),
            destination_id: metadata.routing.meta_destination_id.clone(),
            event_type: metadata.routing.meta_ext_event.clone(),
        }
    }
}

/// Ordered collection of every span recorded for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub trace_id: String,
    pub span_id: String,
    #[schema(value_type = String)]
    pub upload_id: Tguid,
    pub destination_id: String,
    pub event_type: String,
    pub spans: Vec<Span>,
}

impl Trace {
    /// Start an empty trace; trace/span ids follow the W3C widths (32 and 16 hex chars).
    pub fn start(context: &TraceContext) -> Self {
        let trace_id = Uuid::new_v4().simple().to_string();
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        Self {
            trace_id,
            span_id,
            upload_id: context.upload_id.clone(),
            destination_id: context.destination_id.clone(),
            event_type: context.event_type.clone(),
            spans: Vec::new(),
        }
    }

    /// Append a span keeping the sequence ordered by timestamp.
    ///
    /// Spans with equal timestamps keep their arrival order.
    pub fn append(&mut self, span: Span) {
        let at = self
            .spans
            .partition_point(|existing| existing.timestamp <= span.timestamp);
        self.spans.insert(at, span);
    }
}
