//! Postgres-backed retry attempt store (`retry_attempts` table).
//!
//! The `(payment_id, attempt_number)` unique constraint is what makes
//! scheduling a retry idempotent: a second insert maps to `Conflict`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use duebill_core::{AccountId, PaymentFailure, PaymentId};
use duebill_payments::{AttemptOutcome, RetryAttempt};

use crate::error::{map_sqlx_error, StoreError};

use super::store::RetryAttemptStore;

const ATTEMPT_COLUMNS: &str = "id, payment_id, account_id, attempt_number, scheduled_for, outcome, \
     amount, adjusted_amount, failure, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresRetryAttemptStore {
    pool: Arc<PgPool>,
}

impl PostgresRetryAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl RetryAttemptStore for PostgresRetryAttemptStore {
    #[instrument(
        skip(self, attempt),
        fields(payment_id = %attempt.payment_id, attempt_number = attempt.attempt_number),
        err
    )]
    async fn insert(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
        let attempt_number: i32 = column("attempt_number", attempt.attempt_number)?;
        let amount: i64 = column("amount", attempt.amount)?;
        let adjusted_amount: Option<i64> =
            attempt.adjusted_amount.map(|a| column("adjusted_amount", a)).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO retry_attempts (id, payment_id, account_id, attempt_number, scheduled_for,
                                        outcome, amount, adjusted_amount, failure, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.payment_id.as_uuid())
        .bind(attempt.account_id.as_uuid())
        .bind(attempt_number)
        .bind(attempt.scheduled_for)
        .bind(attempt.outcome.as_str())
        .bind(amount)
        .bind(adjusted_amount)
        .bind(attempt.failure.map(|f| f.as_str()))
        .bind(attempt.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert retry attempt", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, attempt),
        fields(payment_id = %attempt.payment_id, attempt_number = attempt.attempt_number),
        err
    )]
    async fn update(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
        let adjusted_amount: Option<i64> =
            attempt.adjusted_amount.map(|a| column("adjusted_amount", a)).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE retry_attempts
            SET scheduled_for = $2, outcome = $3, adjusted_amount = $4, failure = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.scheduled_for)
        .bind(attempt.outcome.as_str())
        .bind(adjusted_amount)
        .bind(attempt.failure.map(|f| f.as_str()))
        .bind(attempt.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update retry attempt", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("retry attempt {}", attempt.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(payment_id = %payment_id), err)]
    async fn get(
        &self,
        payment_id: PaymentId,
        attempt_number: u32,
    ) -> Result<Option<RetryAttempt>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM retry_attempts \
             WHERE payment_id = $1 AND attempt_number = $2"
        );
        let attempt_number: i32 = column("attempt_number", attempt_number)?;
        let row = sqlx::query(&sql)
            .bind(payment_id.as_uuid())
            .bind(attempt_number)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get retry attempt", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(payment_id = %payment_id), err)]
    async fn list_for_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<RetryAttempt>, StoreError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM retry_attempts \
             WHERE payment_id = $1 ORDER BY attempt_number ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(payment_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list retry attempts", e))?;
        rows.iter().map(decode_row).collect()
    }
}

struct RetryAttemptRow {
    id: Uuid,
    payment_id: Uuid,
    account_id: Uuid,
    attempt_number: i32,
    scheduled_for: DateTime<Utc>,
    outcome: String,
    amount: i64,
    adjusted_amount: Option<i64>,
    failure: Option<String>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for RetryAttemptRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            payment_id: row.try_get("payment_id")?,
            account_id: row.try_get("account_id")?,
            attempt_number: row.try_get("attempt_number")?,
            scheduled_for: row.try_get("scheduled_for")?,
            outcome: row.try_get("outcome")?,
            amount: row.try_get("amount")?,
            adjusted_amount: row.try_get("adjusted_amount")?,
            failure: row.try_get("failure")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<RetryAttempt, StoreError> {
    let row =
        RetryAttemptRow::from_row(row).map_err(|e| map_sqlx_error("decode retry attempt", e))?;
    let outcome = AttemptOutcome::parse(&row.outcome)
        .ok_or_else(|| {
            StoreError::Serialization(format!("unknown attempt outcome '{}'", row.outcome))
        })?;
    let failure = match row.failure.as_deref() {
        None => None,
        Some(s) => Some(
            PaymentFailure::parse(s)
                .ok_or_else(|| {
                    StoreError::Serialization(format!("unknown payment failure '{s}'"))
                })?,
        ),
    };

    Ok(RetryAttempt {
        id: row.id,
        payment_id: PaymentId::from_uuid(row.payment_id),
        account_id: AccountId::from_uuid(row.account_id),
        attempt_number: column("attempt_number", row.attempt_number)?,
        scheduled_for: row.scheduled_for,
        outcome,
        amount: column("amount", row.amount)?,
        adjusted_amount: row.adjusted_amount.map(|a| column("adjusted_amount", a)).transpose()?,
        failure,
        updated_at: row.updated_at,
    })
}

/// Convert between Rust and column integer types, refusing values that do not fit.
fn column<T, S>(field: &str, value: S) -> Result<T, StoreError>
where
    T: TryFrom<S>,
    S: Copy + std::fmt::Display,
{
    T::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{field} {value} out of column range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_beyond_bigint_are_refused() {
        assert_eq!(column::<i64, u64>("amount", 10_000).unwrap(), 10_000);
        assert!(matches!(
            column::<i64, u64>("amount", u64::MAX),
            Err(StoreError::Serialization(_))
        ));
        assert!(matches!(
            column::<i32, u32>("attempt_number", u32::MAX),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn negative_columns_do_not_decode() {
        assert!(matches!(column::<u64, i64>("amount", -1), Err(StoreError::Serialization(_))));
        assert_eq!(column::<u32, i32>("attempt_number", 3).unwrap(), 3);
    }
}
