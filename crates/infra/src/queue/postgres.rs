//! Postgres-backed work item store.
//!
//! The claim is a single `UPDATE … WHERE id IN (SELECT … FOR UPDATE SKIP
//! LOCKED) RETURNING`, so any number of dispatchers can share the table and
//! each eligible row is leased to exactly one of them. Rows locked by a
//! concurrent claimer are skipped rather than waited on.
//!
//! Errors are mapped through [`map_sqlx_error`]; serialization failures and
//! deadlocks surface as `StoreError::Conflict`, connection and pool failures
//! as `StoreError::Unavailable`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{map_sqlx_error, StoreError};

use super::store::{WorkItemStore, CANCELLATION_QUEUE};
use super::types::{
    NewWorkItem, OwnerKey, QueueName, QueueStats, WorkItem, WorkItemId, WorkItemStatus,
};

const WORK_ITEM_COLUMNS: &str = "id, queue_name, owner_key, effective_at, payload, created_at, \
     updated_at, claim_owner, claim_expires_at, attempts, status, last_error";

/// Work item store on the `work_items` table.
#[derive(Debug, Clone)]
pub struct PostgresWorkItemStore {
    pool: Arc<PgPool>,
}

impl PostgresWorkItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_items(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64, StoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }

    /// Fails with `NotFound` when `id` names no row at all.
    async fn ensure_exists(&self, operation: &str, id: WorkItemId) -> Result<(), StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM work_items WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("work item {id}")))
        }
    }

    /// Run a claim-guarded settle write. Zero rows means the claim moved on
    /// or the item is terminal, unless the row is missing entirely.
    async fn settled(
        &self,
        operation: &str,
        id: WorkItemId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<bool, StoreError> {
        if self.execute(operation, query).await? > 0 {
            return Ok(true);
        }
        self.ensure_exists(operation, id).await?;
        Ok(false)
    }
}

#[async_trait]
impl WorkItemStore for PostgresWorkItemStore {
    #[instrument(skip(self, item), fields(queue = %item.queue, owner_key = %item.owner_key), err)]
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        let id = WorkItemId::new();
        sqlx::query(
            r#"
            INSERT INTO work_items (id, queue_name, owner_key, effective_at, payload, created_at,
                                    updated_at, attempts, status)
            VALUES ($1, $2, $3, $4, $5, now(), now(), 0, 'available')
            "#,
        )
        .bind(id.0)
        .bind(item.queue.as_str())
        .bind(item.owner_key.as_str())
        .bind(item.effective_at)
        .bind(&item.payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;
        Ok(id)
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn claim_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
        claim_owner: &str,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let sql = format!(
            r#"
            UPDATE work_items
            SET claim_owner = $4, claim_expires_at = $3, updated_at = $2
            WHERE id IN (
                SELECT id FROM work_items
                WHERE queue_name = $1
                  AND status = 'available'
                  AND effective_at <= $2
                  AND (claim_expires_at IS NULL OR claim_expires_at < $2)
                ORDER BY effective_at ASC, created_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {WORK_ITEM_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(queue.as_str())
            .bind(now)
            .bind(expires_at)
            .bind(claim_owner)
            .bind(batch_size as i64);

        // RETURNING has no ordering guarantee
        let mut items = self.fetch_items("claim_due", query).await?;
        items.sort_by_key(|i| (i.effective_at, i.created_at));
        Ok(items)
    }

    #[instrument(skip(self), err)]
    async fn complete(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'processed', claim_owner = NULL, claim_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'available' AND claim_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(claim_owner);
        self.settled("complete", id, query).await
    }

    #[instrument(skip(self), err)]
    async fn release(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET claim_owner = NULL, claim_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND claim_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(claim_owner);
        self.settled("release", id, query).await
    }

    #[instrument(skip(self), err)]
    async fn reschedule(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        effective_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET effective_at = $3, claim_owner = NULL, claim_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND claim_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(claim_owner)
        .bind(effective_at);
        self.settled("reschedule", id, query).await
    }

    #[instrument(skip(self, error), err)]
    async fn record_failure(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET attempts = attempts + 1, last_error = $3, effective_at = $4,
                claim_owner = NULL, claim_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND claim_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(claim_owner)
        .bind(error)
        .bind(retry_at);
        self.settled("record_failure", id, query).await
    }

    #[instrument(skip(self, reason), err)]
    async fn dead_letter(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'dead_lettered', attempts = attempts + 1, last_error = $3,
                claim_owner = NULL, claim_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND status = 'available' AND claim_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(claim_owner)
        .bind(reason);
        self.settled("dead_letter", id, query).await
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: WorkItemId) -> Result<bool, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'cancelled', claim_owner = NULL, claim_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'available'
            "#,
        )
        .bind(id.0);
        if self.execute("cancel", query).await? == 1 {
            return Ok(true);
        }
        self.ensure_exists("cancel", id).await?;
        Ok(false)
    }

    #[instrument(skip(self), fields(queue = %queue, owner_key = %owner), err)]
    async fn cancel_pending(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'cancelled', updated_at = $3
            WHERE queue_name = $1 AND owner_key = $2 AND status = 'available'
              AND effective_at > $3
              AND (claim_expires_at IS NULL OR claim_expires_at < $3)
            "#,
        )
        .bind(queue.as_str())
        .bind(owner.as_str())
        .bind(now);
        self.execute("cancel_pending", query).await
    }

    #[instrument(skip(self), fields(queue = %queue, owner_key = %owner), err)]
    async fn pending_for_owner(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
             WHERE queue_name = $1 AND owner_key = $2 AND status = 'available' \
             ORDER BY effective_at ASC, created_at ASC"
        );
        let query = sqlx::query(&sql).bind(queue.as_str()).bind(owner.as_str());
        self.fetch_items("pending_for_owner", query).await
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1");
        let query = sqlx::query(&sql).bind(id.0);
        Ok(self.fetch_items("get", query).await?.into_iter().next())
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn list_dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items \
             WHERE queue_name = $1 AND status = 'dead_lettered' \
             ORDER BY updated_at ASC LIMIT $2"
        );
        let query = sqlx::query(&sql).bind(queue.as_str()).bind(limit as i64);
        self.fetch_items("list_dead_letters", query).await
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn stats(&self, queue: &QueueName, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'available'
                    AND (claim_expires_at IS NULL OR claim_expires_at < $2)) AS available,
                COUNT(*) FILTER (WHERE status = 'available' AND claim_expires_at >= $2) AS claimed,
                COUNT(*) FILTER (WHERE status = 'processed') AS processed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'dead_lettered') AS dead_lettered
            FROM work_items
            WHERE queue_name = $1
            "#,
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, StoreError> {
            let value: i64 = row.try_get(column).map_err(|e| map_sqlx_error("stats", e))?;
            Ok(value.max(0) as usize)
        };
        Ok(QueueStats {
            available: count("available")?,
            claimed: count("claimed")?,
            processed: count("processed")?,
            cancelled: count("cancelled")?,
            dead_lettered: count("dead_lettered")?,
        })
    }

    #[instrument(skip(self), fields(owner_key = %owner), err)]
    async fn mark_owner_cancelled(
        &self,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_items (id, queue_name, owner_key, effective_at, payload, created_at,
                                    updated_at, attempts, status)
            VALUES ($1, $2, $3, $4, 'null'::jsonb, $4, $4, 0, 'processed')
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(CANCELLATION_QUEUE)
        .bind(owner.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_owner_cancelled", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(owner_key = %owner), err)]
    async fn is_owner_cancelled(&self, owner: &OwnerKey) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM work_items WHERE queue_name = $1 AND owner_key = $2)",
        )
        .bind(CANCELLATION_QUEUE)
        .bind(owner.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("is_owner_cancelled", e))
    }
}

struct WorkItemRow {
    id: Uuid,
    queue_name: String,
    owner_key: String,
    effective_at: DateTime<Utc>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    claim_owner: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    attempts: i32,
    status: String,
    last_error: Option<String>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for WorkItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            owner_key: row.try_get("owner_key")?,
            effective_at: row.try_get("effective_at")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            claim_owner: row.try_get("claim_owner")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            attempts: row.try_get("attempts")?,
            status: row.try_get("status")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let status = WorkItemStatus::parse(&row.status)
            .ok_or_else(|| {
                StoreError::Serialization(format!("unknown work item status '{}'", row.status))
            })?;
        Ok(WorkItem {
            id: WorkItemId::from_uuid(row.id),
            queue: QueueName::new(row.queue_name),
            owner_key: OwnerKey::new(row.owner_key),
            effective_at: row.effective_at,
            payload: row.payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
            claim_owner: row.claim_owner,
            claim_expires_at: row.claim_expires_at,
            attempts: row.attempts.max(0) as u32,
            status,
            last_error: row.last_error,
        })
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<WorkItem, StoreError> {
    let row = WorkItemRow::from_row(row).map_err(|e| map_sqlx_error("decode work item", e))?;
    WorkItem::try_from(row)
}
