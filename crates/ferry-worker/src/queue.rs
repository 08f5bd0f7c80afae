//! Durable at-least-once queue of partial copy-status updates.
//!
//! Received messages stay invisible for a visibility window and come back if they are
//! not acknowledged in time, so consumers must tolerate duplicates and reordering.

use async_trait::async_trait;
use ferry_core::models::ItemInternalCopyStatus;
use sqlx::{PgPool, Row};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Database(_) | QueueError::Unavailable(_))
    }
}

/// A received, not yet acknowledged message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    /// Raw JSON as enqueued; decoding is the consumer's job so poison messages can be dropped
    pub payload: String,
    /// 1 on first delivery
    pub receive_count: u32,
}

#[async_trait]
pub trait CopyStatusQueue: Send + Sync {
    /// Enqueue a raw payload.
    async fn enqueue(&self, payload: String) -> Result<(), QueueError>;

    /// Receive up to `max` visible messages, hiding them for `visibility`.
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Remove a delivered message for good.
    async fn ack(&self, id: i64) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    /// Serialize and enqueue a partial update.
    async fn publish(&self, message: &ItemInternalCopyStatus) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        self.enqueue(payload).await
    }
}

struct QueuedMessage {
    id: i64,
    payload: String,
    visible_at: Instant,
    receive_count: u32,
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: i64,
    messages: Vec<QueuedMessage>,
}

/// In-process queue with the same visibility-timeout semantics as the PostgreSQL queue
#[derive(Default)]
pub struct MemoryCopyStatusQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryCopyStatusQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet acknowledged, visible or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Payloads of every unacknowledged message in enqueue order.
    pub async fn payloads(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.messages.iter().map(|m| m.payload.clone()).collect()
    }
}

#[async_trait]
impl CopyStatusQueue for MemoryCopyStatusQueue {
    async fn enqueue(&self, payload: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.messages.push(QueuedMessage {
            id,
            payload,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        Ok(())
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        for message in state.messages.iter_mut() {
            if deliveries.len() >= max {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.visible_at = now + visibility;
            message.receive_count += 1;
            deliveries.push(Delivery {
                id: message.id,
                payload: message.payload.clone(),
                receive_count: message.receive_count,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.messages.retain(|m| m.id != id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// PostgreSQL-backed queue; concurrent consumers claim rows with `FOR UPDATE SKIP LOCKED`
#[derive(Clone)]
pub struct PostgresCopyStatusQueue {
    pool: PgPool,
}

impl PostgresCopyStatusQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CopyStatusQueue for PostgresCopyStatusQueue {
    #[tracing::instrument(skip(self, payload), fields(db.system = "postgresql", db.table = "copy_status_queue"))]
    async fn enqueue(&self, payload: String) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO copy_status_queue (payload) VALUES ($1)")
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Delivery>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE copy_status_queue
            SET visible_at = NOW() + make_interval(secs => $2),
                receive_count = receive_count + 1
            WHERE id IN (
                SELECT id
                FROM copy_status_queue
                WHERE visible_at <= NOW()
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, receive_count
            "#,
        )
        .bind(max.min(i64::MAX as usize) as i64)
        .bind(visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            let receive_count: i32 = row.try_get("receive_count")?;
            deliveries.push(Delivery {
                id: row.try_get("id")?,
                payload: row.try_get("payload")?,
                receive_count: receive_count.max(0) as u32,
            });
        }
        deliveries.sort_by_key(|d| d.id);
        Ok(deliveries)
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM copy_status_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
