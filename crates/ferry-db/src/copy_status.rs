//! Reconciled copy-status documents with revision-checked writes

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use ferry_core::models::{ItemCopyStatus, Tguid};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A stored document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub document: T,
    pub revision: i64,
}

/// Document store for [`ItemCopyStatus`], keyed by tguid.
///
/// Writes are conditional: `insert` fails with [`StoreError::Conflict`] when the document
/// already exists and `replace` fails the same way when the stored revision moved on.
/// Both stamp `_ts` with the write time.
#[async_trait]
pub trait CopyStatusStore: Send + Sync {
    async fn get(&self, tguid: &Tguid) -> Result<Option<Versioned<ItemCopyStatus>>, StoreError>;

    async fn insert(&self, document: &ItemCopyStatus) -> Result<i64, StoreError>;

    async fn replace(
        &self,
        document: &ItemCopyStatus,
        expected_revision: i64,
    ) -> Result<i64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

fn stamped(document: &ItemCopyStatus) -> ItemCopyStatus {
    let mut document = document.clone();
    document.item.ts = Utc::now().timestamp();
    document
}

/// In-memory copy-status store
#[derive(Default)]
pub struct MemoryCopyStatusStore {
    documents: RwLock<HashMap<Tguid, Versioned<ItemCopyStatus>>>,
}

impl MemoryCopyStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CopyStatusStore for MemoryCopyStatusStore {
    async fn get(&self, tguid: &Tguid) -> Result<Option<Versioned<ItemCopyStatus>>, StoreError> {
        Ok(self.documents.read().await.get(tguid).cloned())
    }

    async fn insert(&self, document: &ItemCopyStatus) -> Result<i64, StoreError> {
        let mut documents = self.documents.write().await;
        let tguid = document.tguid().clone();
        if documents.contains_key(&tguid) {
            return Err(StoreError::Conflict(tguid.to_string()));
        }
        documents.insert(
            tguid,
            Versioned {
                document: stamped(document),
                revision: 1,
            },
        );
        Ok(1)
    }

    async fn replace(
        &self,
        document: &ItemCopyStatus,
        expected_revision: i64,
    ) -> Result<i64, StoreError> {
        let mut documents = self.documents.write().await;
        let tguid = document.tguid();
        match documents.get_mut(tguid) {
            Some(current) if current.revision == expected_revision => {
                current.document = stamped(document);
                current.revision += 1;
                Ok(current.revision)
            }
            _ => Err(StoreError::Conflict(tguid.to_string())),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// PostgreSQL copy-status store, one JSONB document per tguid
#[derive(Clone)]
pub struct PostgresCopyStatusStore {
    pool: PgPool,
}

impl PostgresCopyStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CopyStatusStore for PostgresCopyStatusStore {
    async fn get(&self, tguid: &Tguid) -> Result<Option<Versioned<ItemCopyStatus>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document, revision
            FROM item_copy_status
            WHERE tguid = $1
            "#,
        )
        .bind(tguid.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let Json(document): Json<ItemCopyStatus> = row.try_get("document")?;
                Ok(Some(Versioned {
                    document,
                    revision: row.try_get("revision")?,
                }))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, document), fields(
        db.system = "postgresql",
        db.table = "item_copy_status",
        db.operation = "insert",
        tguid = %document.tguid()
    ))]
    async fn insert(&self, document: &ItemCopyStatus) -> Result<i64, StoreError> {
        let document = stamped(document);
        let result = sqlx::query(
            r#"
            INSERT INTO item_copy_status (tguid, document, revision, updated_at)
            VALUES ($1, $2, 1, NOW())
            ON CONFLICT (tguid) DO NOTHING
            "#,
        )
        .bind(document.tguid().as_str())
        .bind(Json(&document))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(document.tguid().to_string()));
        }
        Ok(1)
    }

    #[tracing::instrument(skip(self, document), fields(
        db.system = "postgresql",
        db.table = "item_copy_status",
        db.operation = "update",
        tguid = %document.tguid()
    ))]
    async fn replace(
        &self,
        document: &ItemCopyStatus,
        expected_revision: i64,
    ) -> Result<i64, StoreError> {
        let document = stamped(document);
        let row = sqlx::query(
            r#"
            UPDATE item_copy_status
            SET document = $2, revision = revision + 1, updated_at = NOW()
            WHERE tguid = $1 AND revision = $3
            RETURNING revision
            "#,
        )
        .bind(document.tguid().as_str())
        .bind(Json(&document))
        .bind(expected_revision)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("revision")?),
            None => Err(StoreError::Conflict(document.tguid().to_string())),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::models::{CopyStatus, Item};

    fn document(tguid: &str) -> ItemCopyStatus {
        ItemCopyStatus::new(Item::placeholder(&tguid.parse().unwrap()))
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = MemoryCopyStatusStore::new();
        let doc = document("U1");
        assert_eq!(store.insert(&doc).await.unwrap(), 1);

        let stored = store.get(doc.tguid()).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert!(stored.document.item.ts > 0);
        assert_eq!(stored.document.status_dex, CopyStatus::Unknown);
    }

    #[tokio::test]
    async fn second_insert_conflicts() {
        let store = MemoryCopyStatusStore::new();
        let doc = document("U1");
        store.insert(&doc).await.unwrap();
        assert!(store.insert(&doc).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn stale_revision_is_rejected() {
        let store = MemoryCopyStatusStore::new();
        let mut doc = document("U1");
        store.insert(&doc).await.unwrap();

        doc.status_dex = CopyStatus::Success;
        assert_eq!(store.replace(&doc, 1).await.unwrap(), 2);

        doc.status_edav = CopyStatus::Failure;
        assert!(store.replace(&doc, 1).await.unwrap_err().is_conflict());

        let stored = store.get(doc.tguid()).await.unwrap().unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.document.status_edav, CopyStatus::Unknown);
    }

    #[tokio::test]
    async fn replace_of_missing_document_conflicts() {
        let store = MemoryCopyStatusStore::new();
        assert!(store.replace(&document("nope"), 1).await.unwrap_err().is_conflict());
    }
}
