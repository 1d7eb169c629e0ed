use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use duebill_core::{AccountId, InvoiceId, PaymentFailure, PaymentId};

use crate::Event;

/// Events the billing system reports to the deferred-work core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    /// A new invoice exists; overdue status must be re-checked once it falls due.
    InvoiceCreated {
        account_id: AccountId,
        invoice_id: InvoiceId,
        /// Amount in smallest currency unit (e.g., cents).
        amount: u64,
        due_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    /// An invoice passed its due date without full payment.
    InvoiceDue {
        account_id: AccountId,
        invoice_id: InvoiceId,
        occurred_at: DateTime<Utc>,
    },
    /// The next billing date of an account is known.
    BillingDateScheduled {
        account_id: AccountId,
        target_date: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    /// A charge failed outside the retry loop (the first attempt).
    PaymentFailed {
        account_id: AccountId,
        payment_id: PaymentId,
        amount: u64,
        failure: PaymentFailure,
        occurred_at: DateTime<Utc>,
    },
    /// A charge succeeded; balances changed.
    PaymentSucceeded {
        account_id: AccountId,
        payment_id: PaymentId,
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    /// The account is closed; pending deferred work must not act on it.
    AccountClosed {
        account_id: AccountId,
        occurred_at: DateTime<Utc>,
    },
}

impl BillingEvent {
    pub fn account_id(&self) -> AccountId {
        match self {
            BillingEvent::InvoiceCreated { account_id, .. }
            | BillingEvent::InvoiceDue { account_id, .. }
            | BillingEvent::BillingDateScheduled { account_id, .. }
            | BillingEvent::PaymentFailed { account_id, .. }
            | BillingEvent::PaymentSucceeded { account_id, .. }
            | BillingEvent::AccountClosed { account_id, .. } => *account_id,
        }
    }
}

impl Event for BillingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::InvoiceCreated { .. } => "invoice.created",
            BillingEvent::InvoiceDue { .. } => "invoice.due",
            BillingEvent::BillingDateScheduled { .. } => "billing.date_scheduled",
            BillingEvent::PaymentFailed { .. } => "payment.failed",
            BillingEvent::PaymentSucceeded { .. } => "payment.succeeded",
            BillingEvent::AccountClosed { .. } => "account.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BillingEvent::InvoiceCreated { occurred_at, .. }
            | BillingEvent::InvoiceDue { occurred_at, .. }
            | BillingEvent::BillingDateScheduled { occurred_at, .. }
            | BillingEvent::PaymentFailed { occurred_at, .. }
            | BillingEvent::PaymentSucceeded { occurred_at, .. }
            | BillingEvent::AccountClosed { occurred_at, .. } => *occurred_at,
        }
    }
}
