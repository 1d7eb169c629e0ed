use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use duebill_core::{AccountId, PaymentFailure, PaymentId};

/// Lifecycle of a single payment attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Scheduled, not yet executed.
    Pending,
    /// Cancelled by a policy or an account restriction. Terminal.
    Aborted,
    Success,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Aborted => "aborted",
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptOutcome::Pending),
            "aborted" => Some(AttemptOutcome::Aborted),
            "success" => Some(AttemptOutcome::Success),
            "failed" => Some(AttemptOutcome::Failed),
            _ => None,
        }
    }
}

/// One try at collecting a payment. Attempt 1 is the original charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub payment_id: PaymentId,
    pub account_id: AccountId,
    pub attempt_number: u32,
    pub scheduled_for: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Original amount in smallest currency unit (e.g., cents).
    pub amount: u64,
    /// Overrides `amount` for this attempt when set.
    pub adjusted_amount: Option<u64>,
    pub failure: Option<PaymentFailure>,
    pub updated_at: DateTime<Utc>,
}

impl RetryAttempt {
    /// The original (first) attempt of a payment, already failed.
    pub fn initial_failure(
        payment_id: PaymentId,
        account_id: AccountId,
        amount: u64,
        failure: PaymentFailure,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            payment_id,
            account_id,
            attempt_number: 1,
            scheduled_for: at,
            outcome: AttemptOutcome::Failed,
            amount,
            adjusted_amount: None,
            failure: Some(failure),
            updated_at: at,
        }
    }

    /// The attempt following this one, pending at `at`.
    pub fn next(
        &self,
        at: DateTime<Utc>,
        adjusted_amount: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            payment_id: self.payment_id,
            account_id: self.account_id,
            attempt_number: self.attempt_number + 1,
            scheduled_for: at,
            outcome: AttemptOutcome::Pending,
            amount: self.amount,
            adjusted_amount,
            failure: None,
            updated_at: now,
        }
    }

    /// Amount to charge on this attempt.
    pub fn effective_amount(&self) -> u64 {
        self.adjusted_amount.unwrap_or(self.amount)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.outcome,
            AttemptOutcome::Aborted | AttemptOutcome::Success
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_attempt_increments_and_carries_adjusted_amount() {
        let now = Utc::now();
        let first = RetryAttempt::initial_failure(
            PaymentId::new(),
            AccountId::new(),
            10_000,
            PaymentFailure::Declined,
            now,
        );
        let second = first.next(now + chrono::Duration::hours(24), Some(9_000), now);

        assert_eq!(second.attempt_number, 2);
        assert_eq!(second.outcome, AttemptOutcome::Pending);
        assert_eq!(second.effective_amount(), 9_000);
        assert_eq!(first.effective_amount(), 10_000);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn outcome_round_trips_through_storage_names() {
        for o in [
            AttemptOutcome::Pending,
            AttemptOutcome::Aborted,
            AttemptOutcome::Success,
            AttemptOutcome::Failed,
        ] {
            assert_eq!(AttemptOutcome::parse(o.as_str()), Some(o));
        }
        assert_eq!(AttemptOutcome::parse("bogus"), None);
    }
}
