use serde::{Deserialize, Serialize};

use duebill_core::PaymentFailure;

use crate::facts::AccountFacts;

/// Conjunction of optional criteria over [`AccountFacts`].
///
/// Every criterion that is set must hold; unset criteria are ignored. A
/// condition with no criteria at all is rejected when a state set is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_overdue_at_least: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpaid_invoice_count_at_least: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unpaid_balance_at_least: Option<u64>,
    /// All of these tags must be present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_include: Vec<String>,
    /// None of these tags may be present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method_missing: Option<bool>,
    /// Matches when the last failed payment failed for one of these reasons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_payment_failure_in: Vec<PaymentFailure>,
}

impl Condition {
    pub fn days_overdue_at_least(days: u32) -> Self {
        Self {
            days_overdue_at_least: Some(days),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.days_overdue_at_least.is_none()
            && self.unpaid_invoice_count_at_least.is_none()
            && self.unpaid_balance_at_least.is_none()
            && self.tags_include.is_empty()
            && self.tags_exclude.is_empty()
            && self.payment_method_missing.is_none()
            && self.last_payment_failure_in.is_empty()
    }

    pub fn matches(&self, facts: &AccountFacts) -> bool {
        if let Some(days) = self.days_overdue_at_least {
            if facts.days_overdue < days {
                return false;
            }
        }
        if let Some(count) = self.unpaid_invoice_count_at_least {
            if facts.unpaid_invoice_count < count {
                return false;
            }
        }
        if let Some(balance) = self.unpaid_balance_at_least {
            if facts.unpaid_balance < balance {
                return false;
            }
        }
        if !self.tags_include.iter().all(|t| facts.has_tag(t)) {
            return false;
        }
        if self.tags_exclude.iter().any(|t| facts.has_tag(t)) {
            return false;
        }
        if let Some(missing) = self.payment_method_missing {
            if missing == facts.payment_method_present {
                return false;
            }
        }
        if !self.last_payment_failure_in.is_empty() {
            match facts.last_payment_failure {
                Some(f) if self.last_payment_failure_in.contains(&f) => {}
                _ => return false,
            }
        }
        true
    }
}
