//! Postgres-backed overdue state store (`overdue_states` table).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use duebill_core::{AccountId, ExpectedVersion};
use duebill_overdue::{BlockFlags, OverdueState};

use crate::error::{map_sqlx_error, StoreError};

use super::store::OverdueStateStore;

#[derive(Debug, Clone)]
pub struct PostgresOverdueStateStore {
    pool: Arc<PgPool>,
}

impl PostgresOverdueStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl OverdueStateStore for PostgresOverdueStateStore {
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    async fn get(&self, account_id: AccountId) -> Result<Option<OverdueState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, state_name, state_set_version, block_changes, block_entitlement,
                   disable_auto_pay, last_transition_at, version
            FROM overdue_states
            WHERE account_id = $1
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get overdue state", e))?;

        row.map(|r| {
            OverdueStateRow::from_row(&r)
                .map(Into::into)
                .map_err(|e| map_sqlx_error("decode overdue state", e))
        })
        .transpose()
    }

    /// Insert for `Absent`, versioned update for `Exact`, upsert for `Any`.
    /// Zero affected rows on a guarded write means another writer won.
    #[instrument(
        skip(self, state),
        fields(account_id = %state.account_id, state = %state.state_name, version = state.version),
        err
    )]
    async fn save(
        &self,
        state: &OverdueState,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let sql = match expected {
            ExpectedVersion::Absent => {
                r#"
                INSERT INTO overdue_states (account_id, state_name, state_set_version,
                    block_changes, block_entitlement, disable_auto_pay, last_transition_at,
                    version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (account_id) DO NOTHING
                "#
            }
            ExpectedVersion::Exact(_) => {
                r#"
                UPDATE overdue_states
                SET state_name = $2, state_set_version = $3, block_changes = $4,
                    block_entitlement = $5, disable_auto_pay = $6, last_transition_at = $7,
                    version = $8
                WHERE account_id = $1 AND version = $9
                "#
            }
            ExpectedVersion::Any => {
                r#"
                INSERT INTO overdue_states (account_id, state_name, state_set_version,
                    block_changes, block_entitlement, disable_auto_pay, last_transition_at,
                    version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (account_id) DO UPDATE
                SET state_name = EXCLUDED.state_name,
                    state_set_version = EXCLUDED.state_set_version,
                    block_changes = EXCLUDED.block_changes,
                    block_entitlement = EXCLUDED.block_entitlement,
                    disable_auto_pay = EXCLUDED.disable_auto_pay,
                    last_transition_at = EXCLUDED.last_transition_at,
                    version = EXCLUDED.version
                "#
            }
        };

        let mut query = sqlx::query(sql)
            .bind(state.account_id.as_uuid())
            .bind(&state.state_name)
            .bind(state.state_set_version as i64)
            .bind(state.blocked.block_changes)
            .bind(state.blocked.block_entitlement)
            .bind(state.blocked.disable_auto_pay)
            .bind(state.last_transition_at)
            .bind(state.version as i64);
        if let ExpectedVersion::Exact(v) = expected {
            query = query.bind(v as i64);
        }

        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save overdue state", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "overdue state of account {} changed concurrently (expected {:?})",
                state.account_id, expected
            )));
        }
        Ok(())
    }
}

struct OverdueStateRow {
    account_id: Uuid,
    state_name: String,
    state_set_version: i64,
    block_changes: bool,
    block_entitlement: bool,
    disable_auto_pay: bool,
    last_transition_at: Option<DateTime<Utc>>,
    version: i64,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OverdueStateRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            account_id: row.try_get("account_id")?,
            state_name: row.try_get("state_name")?,
            state_set_version: row.try_get("state_set_version")?,
            block_changes: row.try_get("block_changes")?,
            block_entitlement: row.try_get("block_entitlement")?,
            disable_auto_pay: row.try_get("disable_auto_pay")?,
            last_transition_at: row.try_get("last_transition_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl From<OverdueStateRow> for OverdueState {
    fn from(row: OverdueStateRow) -> Self {
        OverdueState {
            account_id: AccountId::from_uuid(row.account_id),
            state_name: row.state_name,
            state_set_version: row.state_set_version.max(0) as u64,
            blocked: BlockFlags {
                block_changes: row.block_changes,
                block_entitlement: row.block_entitlement,
                disable_auto_pay: row.disable_auto_pay,
            },
            last_transition_at: row.last_transition_at,
            version: row.version.max(0) as u64,
        }
    }
}
