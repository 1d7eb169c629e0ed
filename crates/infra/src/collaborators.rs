//! Narrow interfaces to the rest of the billing platform.
//!
//! Accounts, invoices and payments live elsewhere; the deferred-work core
//! reaches them only through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use duebill_core::{AccountId, InvoiceId, PaymentFailure, PaymentId};
use duebill_overdue::{AccountFacts, BlockFlags};

/// Failure of an external collaborator. Always treated as transient by the
/// handlers: the work item is retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Read-only snapshot of the facts overdue conditions are evaluated against.
#[async_trait]
pub trait AccountFactsSource: Send + Sync {
    async fn get(&self, account_id: AccountId) -> Result<AccountFacts, CollaboratorError>;
}

/// Applies the block flags of the current overdue state. Must be idempotent.
#[async_trait]
pub trait EntitlementGate: Send + Sync {
    async fn set_blocked(
        &self,
        account_id: AccountId,
        flags: BlockFlags,
    ) -> Result<(), CollaboratorError>;
}

/// One charge to submit to the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub payment_id: PaymentId,
    pub account_id: AccountId,
    pub attempt_number: u32,
    pub amount: u64,
}

/// Gateway answer for a submitted charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Succeeded,
    Failed(PaymentFailure),
}

#[async_trait]
pub trait PaymentAttemptExecutor: Send + Sync {
    async fn attempt(&self, request: &PaymentRequest) -> Result<AttemptResult, CollaboratorError>;
}

/// Generates the invoices of an account due at its billing date.
#[async_trait]
pub trait InvoiceGenerator: Send + Sync {
    async fn generate(
        &self,
        account_id: AccountId,
        target_date: DateTime<Utc>,
    ) -> Result<Vec<InvoiceId>, CollaboratorError>;
}

/// Gate that only logs. For deployments where entitlement is enforced by
/// reading the overdue status instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEntitlementGate;

#[async_trait]
impl EntitlementGate for LoggingEntitlementGate {
    async fn set_blocked(
        &self,
        account_id: AccountId,
        flags: BlockFlags,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(
            account_id = %account_id,
            block_changes = flags.block_changes,
            block_entitlement = flags.block_entitlement,
            disable_auto_pay = flags.disable_auto_pay,
            "entitlement flags changed"
        );
        Ok(())
    }
}
