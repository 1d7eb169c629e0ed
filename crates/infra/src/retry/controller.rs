//! Retry policy controller.
//!
//! Turns a policy decision about a failed attempt into durable effects: the
//! attempt's final outcome, the next pending attempt row and the
//! `payment.retry` work item that will execute it. A hard ceiling on the
//! attempt number bounds the loop even if a policy never aborts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use duebill_core::{AccountId, PaymentFailure, PaymentId};
use duebill_payments::{
    AttemptOutcome, PaymentRetryPolicy, RetryAttempt, RetryContext, RetryDecision,
};

use crate::error::StoreError;
use crate::queue::{NewWorkItem, OwnerKey, QueueName, WorkItemId, WorkItemStore};

use super::store::RetryAttemptStore;
use super::PAYMENT_RETRY_QUEUE;

/// Payload of `payment.retry` items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentRetryPayload {
    /// The original charge failed; record it as attempt 1 and ask the policy.
    InitialFailure {
        payment_id: PaymentId,
        account_id: AccountId,
        amount: u64,
        failure: PaymentFailure,
        failed_at: DateTime<Utc>,
    },
    /// Execute a pending attempt.
    ScheduledRetry {
        payment_id: PaymentId,
        account_id: AccountId,
        attempt_number: u32,
        /// Amount to charge (the adjusted amount when the policy set one).
        amount: u64,
    },
}

impl PaymentRetryPayload {
    pub fn account_id(&self) -> AccountId {
        match self {
            PaymentRetryPayload::InitialFailure { account_id, .. }
            | PaymentRetryPayload::ScheduledRetry { account_id, .. } => *account_id,
        }
    }
}

/// What happened to the payment after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDirective {
    /// The policy gave up; the attempt is terminal-aborted.
    Aborted { reason: String },
    /// The attempt ceiling was reached; no further attempt.
    Exhausted { attempts: u32 },
    /// A further attempt is scheduled.
    Scheduled {
        attempt_number: u32,
        at: DateTime<Utc>,
        amount: u64,
        /// Work item created by this call; `None` when it already existed.
        work_item: Option<WorkItemId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("attempt {attempt_number} of payment {payment_id} not found")]
    AttemptNotFound { payment_id: PaymentId, attempt_number: u32 },
}

pub struct RetryController {
    attempts: Arc<dyn RetryAttemptStore>,
    work: Arc<dyn WorkItemStore>,
    policy: Arc<dyn PaymentRetryPolicy>,
    max_attempts: u32,
}

impl RetryController {
    /// Default ceiling: the original charge plus three retries.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

    pub fn new(
        attempts: Arc<dyn RetryAttemptStore>,
        work: Arc<dyn WorkItemStore>,
        policy: Arc<dyn PaymentRetryPolicy>,
    ) -> Self {
        Self {
            attempts,
            work,
            policy,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub fn attempts(&self) -> &dyn RetryAttemptStore {
        self.attempts.as_ref()
    }

    /// Ask the configured policy about a failed attempt and apply its answer.
    pub async fn handle_failure(
        &self,
        attempt: &RetryAttempt,
        now: DateTime<Utc>,
    ) -> Result<RetryDirective, RetryError> {
        let decision = self.decide(attempt, now);
        self.on_attempt_outcome(attempt, decision, now).await
    }

    /// Finish scheduling after an attempt that is already recorded `Failed`.
    ///
    /// A delivery that failed between marking the attempt and scheduling the
    /// next one is redelivered with the attempt already `Failed`. The policy
    /// is asked again as of the recorded failure time, so the decision is the
    /// one the interrupted delivery took, and the missing row or work item is
    /// created.
    pub async fn resume_failed(
        &self,
        attempt: &RetryAttempt,
    ) -> Result<RetryDirective, RetryError> {
        let failed_at = attempt.updated_at;
        let decision = self.decide(attempt, failed_at);
        self.on_attempt_outcome(attempt, decision, failed_at).await
    }

    fn decide(&self, attempt: &RetryAttempt, failed_at: DateTime<Utc>) -> RetryDecision {
        let ctx = RetryContext {
            payment_id: attempt.payment_id,
            account_id: attempt.account_id,
            attempt_number: attempt.attempt_number,
            amount: attempt.amount,
            attempted_amount: attempt.effective_amount(),
            failure: attempt.failure.unwrap_or(PaymentFailure::GatewayError),
            failed_at,
        };
        let decision = self.policy.decide(&ctx);
        debug!(policy = self.policy.name(), decision = ?decision, "retry policy decided");
        decision
    }

    /// Apply `decision` to the failed `attempt`.
    ///
    /// Idempotent: when attempt `n+1` already exists no second row or work
    /// item is created, and a work item missing for a pending row is
    /// enqueued again.
    #[instrument(
        skip(self, attempt),
        fields(payment_id = %attempt.payment_id, attempt_number = attempt.attempt_number),
        err
    )]
    pub async fn on_attempt_outcome(
        &self,
        attempt: &RetryAttempt,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<RetryDirective, RetryError> {
        if attempt.attempt_number >= self.max_attempts {
            self.finish(attempt, AttemptOutcome::Failed, now).await?;
            info!(max_attempts = self.max_attempts, "payment retries exhausted");
            return Ok(RetryDirective::Exhausted {
                attempts: attempt.attempt_number,
            });
        }

        match decision {
            RetryDecision::Abort { reason } => {
                self.finish(attempt, AttemptOutcome::Aborted, now).await?;
                info!(reason = %reason, "payment retry aborted by policy");
                Ok(RetryDirective::Aborted { reason })
            }
            RetryDecision::RetryAt { at, adjusted_amount } => {
                self.finish(attempt, AttemptOutcome::Failed, now).await?;
                self.schedule(attempt, at, adjusted_amount, now).await
            }
        }
    }

    /// Mark an attempt as collected.
    pub async fn record_success(
        &self,
        attempt: &RetryAttempt,
        now: DateTime<Utc>,
    ) -> Result<(), RetryError> {
        self.finish(attempt, AttemptOutcome::Success, now).await?;
        info!(
            payment_id = %attempt.payment_id,
            attempt_number = attempt.attempt_number,
            "payment collected"
        );
        Ok(())
    }

    /// Mark an attempt aborted outside of a policy decision (account restrictions).
    pub async fn abort(
        &self,
        attempt: &RetryAttempt,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDirective, RetryError> {
        self.finish(attempt, AttemptOutcome::Aborted, now).await?;
        info!(
            payment_id = %attempt.payment_id,
            attempt_number = attempt.attempt_number,
            reason,
            "payment attempt aborted"
        );
        Ok(RetryDirective::Aborted {
            reason: reason.to_string(),
        })
    }

    async fn finish(
        &self,
        attempt: &RetryAttempt,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), RetryError> {
        if attempt.outcome == outcome {
            return Ok(());
        }
        let mut updated = attempt.clone();
        updated.outcome = outcome;
        updated.updated_at = now;
        self.attempts.update(&updated).await?;
        Ok(())
    }

    async fn schedule(
        &self,
        attempt: &RetryAttempt,
        at: DateTime<Utc>,
        adjusted_amount: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<RetryDirective, RetryError> {
        let candidate = attempt.next(at, adjusted_amount, now);
        let next = match self.attempts.insert(&candidate).await {
            Ok(()) => candidate,
            Err(StoreError::Conflict(_)) => self
                .attempts
                .get(attempt.payment_id, candidate.attempt_number)
                .await?
                .ok_or(RetryError::AttemptNotFound {
                    payment_id: attempt.payment_id,
                    attempt_number: candidate.attempt_number,
                })?,
            Err(e) => return Err(e.into()),
        };

        let payload = PaymentRetryPayload::ScheduledRetry {
            payment_id: next.payment_id,
            account_id: next.account_id,
            attempt_number: next.attempt_number,
            amount: next.effective_amount(),
        };

        let needs_item =
            next.outcome == AttemptOutcome::Pending && !self.is_enqueued(&payload).await?;
        let work_item = if needs_item {
            let value = serde_json::to_value(&payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let id = self
                .work
                .enqueue(NewWorkItem::new(
                    PAYMENT_RETRY_QUEUE,
                    OwnerKey::from(next.account_id),
                    next.scheduled_for,
                    value,
                ))
                .await?;
            info!(
                next_attempt = next.attempt_number,
                retry_at = %next.scheduled_for,
                amount = next.effective_amount(),
                "payment retry scheduled"
            );
            Some(id)
        } else {
            warn!(next_attempt = next.attempt_number, "retry already scheduled, nothing to do");
            None
        };

        Ok(RetryDirective::Scheduled {
            attempt_number: next.attempt_number,
            at: next.scheduled_for,
            amount: next.effective_amount(),
            work_item,
        })
    }

    async fn is_enqueued(&self, payload: &PaymentRetryPayload) -> Result<bool, RetryError> {
        let pending = self
            .work
            .pending_for_owner(
                &QueueName::new(PAYMENT_RETRY_QUEUE),
                &OwnerKey::from(payload.account_id()),
            )
            .await?;
        Ok(pending
            .iter()
            .filter_map(|item| item.payload_as::<PaymentRetryPayload>().ok())
            .any(|p| same_attempt(&p, payload)))
    }
}

fn same_attempt(a: &PaymentRetryPayload, b: &PaymentRetryPayload) -> bool {
    match (a, b) {
        (
            PaymentRetryPayload::ScheduledRetry {
                payment_id: p1,
                attempt_number: n1,
                ..
            },
            PaymentRetryPayload::ScheduledRetry {
                payment_id: p2,
                attempt_number: n2,
                ..
            },
        ) => p1 == p2 && n1 == n2,
        _ => false,
    }
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy.name())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
