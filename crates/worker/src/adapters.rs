//! Collaborator adapters for running the worker on its own.
//!
//! Account facts come from a JSON file keyed by account id, re-read on every
//! lookup so an operator can edit it in place. Payments and invoice
//! generation are not wired to real systems here: charges are refused as
//! non-retryable and billing dates produce no invoices, both logged.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use duebill_core::{AccountId, InvoiceId, PaymentFailure};
use duebill_infra::{
    AccountFactsSource, AttemptResult, CollaboratorError, InvoiceGenerator, PaymentAttemptExecutor,
    PaymentRequest,
};
use duebill_overdue::AccountFacts;

#[derive(Debug, Clone)]
pub struct FileAccountFacts {
    path: PathBuf,
}

impl FileAccountFacts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<AccountId, AccountFacts>, CollaboratorError> {
        let path = self.path.display();
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("cannot read {path}: {e}")))?;
        let by_key: HashMap<String, AccountFacts> = serde_json::from_str(&raw)
            .map_err(|e| CollaboratorError::Unavailable(format!("malformed {path}: {e}")))?;

        let mut facts = HashMap::with_capacity(by_key.len());
        for (key, value) in by_key {
            match key.parse::<AccountId>() {
                Ok(id) => {
                    facts.insert(id, value);
                }
                Err(_) => warn!(
                    key = %key,
                    path = %path,
                    "ignoring facts entry with invalid account id"
                ),
            }
        }
        Ok(facts)
    }
}

#[async_trait]
impl AccountFactsSource for FileAccountFacts {
    async fn get(&self, account_id: AccountId) -> Result<AccountFacts, CollaboratorError> {
        self.load()
            .await?
            .remove(&account_id)
            .ok_or(CollaboratorError::UnknownAccount(account_id))
    }
}

/// Refuses every charge. Retries of a refused charge abort under the
/// built-in policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGatewayExecutor;

#[async_trait]
impl PaymentAttemptExecutor for NoGatewayExecutor {
    async fn attempt(&self, request: &PaymentRequest) -> Result<AttemptResult, CollaboratorError> {
        warn!(
            payment_id = %request.payment_id,
            account_id = %request.account_id,
            attempt_number = request.attempt_number,
            amount = request.amount,
            "no payment gateway configured, refusing charge"
        );
        Ok(AttemptResult::Failed(PaymentFailure::NonRetryable))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInvoiceGenerator;

#[async_trait]
impl InvoiceGenerator for LoggingInvoiceGenerator {
    async fn generate(
        &self,
        account_id: AccountId,
        target_date: DateTime<Utc>,
    ) -> Result<Vec<InvoiceId>, CollaboratorError> {
        tracing::info!(
            account_id = %account_id,
            target_date = %target_date,
            "billing date reached, no invoice generator configured"
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn facts_file_is_read_per_lookup() {
        let account = AccountId::new();
        let path = std::env::temp_dir()
            .join(format!("duebill-facts-{}.json", uuid::Uuid::now_v7()));
        let source = FileAccountFacts::new(&path);

        assert!(matches!(source.get(account).await, Err(CollaboratorError::Unavailable(_))));

        let doc = serde_json::json!({
            account.to_string(): {
                "days_overdue": 12,
                "unpaid_invoice_count": 1,
                "unpaid_balance": 900
            },
            "not-an-id": {}
        });
        tokio::fs::write(&path, doc.to_string()).await.unwrap();

        let facts = source.get(account).await.unwrap();
        assert_eq!(facts.days_overdue, 12);
        assert_eq!(facts.unpaid_balance, 900);
        assert!(matches!(
            source.get(AccountId::new()).await,
            Err(CollaboratorError::UnknownAccount(_))
        ));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
