use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use duebill_core::PaymentFailure;

/// Read-only snapshot of an account, as supplied by the account collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountFacts {
    /// Days since the oldest unpaid invoice fell due (0 when nothing is overdue).
    pub days_overdue: u32,
    pub unpaid_invoice_count: u32,
    /// Unpaid balance in smallest currency unit (e.g., cents).
    pub unpaid_balance: u64,
    pub tags: BTreeSet<String>,
    pub payment_method_present: bool,
    pub last_payment_failure: Option<PaymentFailure>,
}

impl AccountFacts {
    /// Facts of an account with nothing owed.
    pub fn settled() -> Self {
        Self {
            payment_method_present: true,
            ..Default::default()
        }
    }

    pub fn overdue(days_overdue: u32, unpaid_balance: u64) -> Self {
        Self {
            days_overdue,
            unpaid_invoice_count: 1,
            unpaid_balance,
            payment_method_present: true,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}
