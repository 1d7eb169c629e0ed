//! Payment failure classification shared by the overdue and retry rules.

use serde::{Deserialize, Serialize};

/// Why a payment attempt did not succeed, as reported by the gateway collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentFailure {
    /// The processor declined the charge (insufficient funds, card limit, ...).
    Declined,
    /// The gateway or its plugin failed (timeout, 5xx, connectivity).
    GatewayError,
    /// The payment method is unusable and retrying cannot help.
    NonRetryable,
}

impl PaymentFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentFailure::Declined => "declined",
            PaymentFailure::GatewayError => "gateway_error",
            PaymentFailure::NonRetryable => "non_retryable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "declined" => Some(PaymentFailure::Declined),
            "gateway_error" => Some(PaymentFailure::GatewayError),
            "non_retryable" => Some(PaymentFailure::NonRetryable),
            _ => None,
        }
    }
}

impl core::fmt::Display for PaymentFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
