//! Retry attempt persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use duebill_core::PaymentId;
use duebill_payments::RetryAttempt;

use crate::error::StoreError;

/// Storage of [`RetryAttempt`] rows, unique per (payment, attempt number).
#[async_trait]
pub trait RetryAttemptStore: Send + Sync {
    /// Fails with `StoreError::Conflict` when the attempt number is taken.
    async fn insert(&self, attempt: &RetryAttempt) -> Result<(), StoreError>;

    /// Overwrite the row with the same id.
    async fn update(&self, attempt: &RetryAttempt) -> Result<(), StoreError>;

    async fn get(
        &self,
        payment_id: PaymentId,
        attempt_number: u32,
    ) -> Result<Option<RetryAttempt>, StoreError>;

    /// All attempts of a payment, by attempt number.
    async fn list_for_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<RetryAttempt>, StoreError>;
}

/// In-memory retry attempt store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRetryAttemptStore {
    attempts: Mutex<HashMap<(PaymentId, u32), RetryAttempt>>,
}

impl InMemoryRetryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryAttemptStore for InMemoryRetryAttemptStore {
    async fn insert(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
        let mut attempts = self.attempts.lock().map_err(|_| StoreError::poisoned())?;
        let key = (attempt.payment_id, attempt.attempt_number);
        if attempts.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "attempt {} of payment {} already exists",
                attempt.attempt_number, attempt.payment_id
            )));
        }
        attempts.insert(key, attempt.clone());
        Ok(())
    }

    async fn update(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
        let mut attempts = self.attempts.lock().map_err(|_| StoreError::poisoned())?;
        match attempts.get_mut(&(attempt.payment_id, attempt.attempt_number)) {
            Some(existing) if existing.id == attempt.id => {
                *existing = attempt.clone();
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("retry attempt {}", attempt.id))),
        }
    }

    async fn get(
        &self,
        payment_id: PaymentId,
        attempt_number: u32,
    ) -> Result<Option<RetryAttempt>, StoreError> {
        let attempts = self.attempts.lock().map_err(|_| StoreError::poisoned())?;
        Ok(attempts.get(&(payment_id, attempt_number)).cloned())
    }

    async fn list_for_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<RetryAttempt>, StoreError> {
        let attempts = self.attempts.lock().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<_> = attempts
            .values()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.attempt_number);
        Ok(result)
    }
}
