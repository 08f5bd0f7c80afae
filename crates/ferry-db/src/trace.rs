//! Append-only trace storage

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_core::models::{Span, SpanStatus, Tguid, Trace, TraceContext};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage for the spans recorded against each upload.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Append a span, creating the trace on the first span for an upload.
    async fn append_span(&self, context: &TraceContext, span: Span) -> Result<(), StoreError>;

    /// Full trace with spans ordered by timestamp, or `None` if nothing was recorded.
    async fn get_trace(&self, upload_id: &Tguid) -> Result<Option<Trace>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-memory trace store
#[derive(Default)]
pub struct MemoryTraceStore {
    traces: RwLock<HashMap<Tguid, Trace>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn append_span(&self, context: &TraceContext, span: Span) -> Result<(), StoreError> {
        let mut traces = self.traces.write().await;
        traces
            .entry(context.upload_id.clone())
            .or_insert_with(|| Trace::start(context))
            .append(span);
        Ok(())
    }

    async fn get_trace(&self, upload_id: &Tguid) -> Result<Option<Trace>, StoreError> {
        let traces = self.traces.read().await;
        Ok(traces.get(upload_id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// PostgreSQL trace store: one `traces` row per upload plus one `trace_spans` row per span
#[derive(Clone)]
pub struct PostgresTraceStore {
    pool: PgPool,
}

impl PostgresTraceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_span_status(raw: &str) -> Result<SpanStatus, StoreError> {
    match raw {
        "success" => Ok(SpanStatus::Success),
        "failure" => Ok(SpanStatus::Failure),
        other => Err(StoreError::Unavailable(format!(
            "Unknown span status in trace_spans: {}",
            other
        ))),
    }
}

#[async_trait]
impl TraceStore for PostgresTraceStore {
    #[tracing::instrument(skip(self, context, span), fields(
        db.system = "postgresql",
        db.table = "trace_spans",
        db.operation = "insert",
        upload_id = %context.upload_id,
        stage = %span.stage_name
    ))]
    async fn append_span(&self, context: &TraceContext, span: Span) -> Result<(), StoreError> {
        let trace = Trace::start(context);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO traces (upload_id, trace_id, span_id, destination_id, event_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (upload_id) DO NOTHING
            "#,
        )
        .bind(trace.upload_id.as_str())
        .bind(&trace.trace_id)
        .bind(&trace.span_id)
        .bind(&trace.destination_id)
        .bind(&trace.event_type)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO trace_spans (upload_id, stage_name, recorded_at, status, elapsed_millis)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(context.upload_id.as_str())
        .bind(&span.stage_name)
        .bind(span.timestamp)
        .bind(span.status.to_string())
        .bind(span.elapsed_millis.min(i64::MAX as u64) as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_trace(&self, upload_id: &Tguid) -> Result<Option<Trace>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT trace_id, span_id, destination_id, event_type
            FROM traces
            WHERE upload_id = $1
            "#,
        )
        .bind(upload_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let span_rows = sqlx::query(
            r#"
            SELECT stage_name, recorded_at, status, elapsed_millis
            FROM trace_spans
            WHERE upload_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(upload_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut spans = Vec::with_capacity(span_rows.len());
        for span_row in span_rows {
            let status: String = span_row.try_get("status")?;
            let timestamp: DateTime<Utc> = span_row.try_get("recorded_at")?;
            let elapsed: i64 = span_row.try_get("elapsed_millis")?;
            spans.push(Span {
                stage_name: span_row.try_get("stage_name")?,
                timestamp,
                status: parse_span_status(&status)?,
                elapsed_millis: elapsed.max(0) as u64,
            });
        }

        Ok(Some(Trace {
            trace_id: row.try_get("trace_id")?,
            span_id: row.try_get("span_id")?,
            upload_id: upload_id.clone(),
            destination_id: row.try_get("destination_id")?,
            event_type: row.try_get("event_type")?,
            spans,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn context(upload_id: &str) -> TraceContext {
        TraceContext {
            upload_id: upload_id.parse().unwrap(),
            destination_id: "dextesting".to_string(),
            event_type: "testevent1".to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let store = MemoryTraceStore::new();
        let result = store.get_trace(&"nothing".parse().unwrap()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn returns_exactly_the_recorded_spans_in_order() {
        let store = MemoryTraceStore::new();
        let ctx = context("U1");
        let base = Utc::now();

        for (i, stage) in ["dex-copy", "upload-received", "edav-copy"].iter().enumerate() {
            let mut span = Span::finished(*stage, SpanStatus::Success, Duration::ZERO);
            // upload-received is the earliest even though it arrives second
            span.timestamp = match *stage {
                "upload-received" => base - ChronoDuration::seconds(10),
                _ => base + ChronoDuration::seconds(i as i64),
            };
            store.append_span(&ctx, span).await.unwrap();
        }

        let trace = store.get_trace(&ctx.upload_id).await.unwrap().unwrap();
        let stages: Vec<_> = trace.spans.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(stages, vec!["upload-received", "dex-copy", "edav-copy"]);
        assert_eq!(trace.destination_id, "dextesting");
    }

    #[tokio::test]
    async fn trace_identity_is_stable_across_appends() {
        let store = MemoryTraceStore::new();
        let ctx = context("U1");
        store
            .append_span(&ctx, Span::finished("a", SpanStatus::Success, Duration::ZERO))
            .await
            .unwrap();
        let first = store.get_trace(&ctx.upload_id).await.unwrap().unwrap();
        store
            .append_span(&ctx, Span::finished("b", SpanStatus::Failure, Duration::ZERO))
            .await
            .unwrap();
        let second = store.get_trace(&ctx.upload_id).await.unwrap().unwrap();
        assert_eq!(first.trace_id, second.trace_id);
        assert_eq!(second.spans.len(), 2);
    }

    #[test]
    fn span_status_parsing() {
        assert_eq!(parse_span_status("success").unwrap(), SpanStatus::Success);
        assert!(parse_span_status("bogus").is_err());
    }
}
