//! Pluggable payment retry policies.
//!
//! A policy is a pure function from the outcome of a failed attempt to a
//! [`RetryDecision`]. Policies are registered by name in a
//! [`RetryPolicyRegistry`] and selected through configuration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use duebill_core::{AccountId, PaymentFailure, PaymentId};

/// What a policy sees about the attempt that just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub payment_id: PaymentId,
    pub account_id: AccountId,
    /// Number of the attempt that failed (1 = original charge).
    pub attempt_number: u32,
    /// Original amount of the payment.
    pub amount: u64,
    /// Amount charged on the failed attempt.
    pub attempted_amount: u64,
    pub failure: PaymentFailure,
    pub failed_at: DateTime<Utc>,
}

/// Decision returned by a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stop retrying. A business decision, not an error.
    Abort { reason: String },
    /// Try again at `at`, optionally charging a different amount.
    RetryAt {
        at: DateTime<Utc>,
        adjusted_amount: Option<u64>,
    },
}

impl RetryDecision {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    pub fn retry_at(at: DateTime<Utc>) -> Self {
        Self::RetryAt {
            at,
            adjusted_amount: None,
        }
    }

    /// Retry `delay` after `failed_at`, or abort when that date is not representable.
    pub fn retry_after(failed_at: DateTime<Utc>, delay: Duration) -> Self {
        match failed_at.checked_add_signed(delay) {
            Some(at) => Self::retry_at(at),
            None => Self::abort("retry date out of range"),
        }
    }
}

/// Capability: given an outcome, decide whether and when to retry.
pub trait PaymentRetryPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, ctx: &RetryContext) -> RetryDecision;
}

/// Retries after fixed day offsets, one per retry (default 8, 8, 8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedScheduleRetryPolicy {
    pub retry_days: Vec<u32>,
}

impl Default for FixedScheduleRetryPolicy {
    fn default() -> Self {
        Self {
            retry_days: vec![8, 8, 8],
        }
    }
}

impl PaymentRetryPolicy for FixedScheduleRetryPolicy {
    fn name(&self) -> &str {
        "fixed-schedule"
    }

    fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        let idx = ctx.attempt_number.saturating_sub(1) as usize;
        match self.retry_days.get(idx) {
            Some(days) => {
                RetryDecision::retry_after(ctx.failed_at, Duration::days(i64::from(*days)))
            }
            None => RetryDecision::abort("retry schedule exhausted"),
        }
    }
}

/// Exponential backoff for gateway failures: `start * multiplier^(n-1)`, capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialRetryPolicy {
    pub start: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self {
            start: Duration::minutes(5),
            multiplier: 2,
            max_delay: Duration::hours(24),
            max_retries: 8,
        }
    }
}

impl ExponentialRetryPolicy {
    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = (self.multiplier.max(1) as i64).saturating_pow(retry.saturating_sub(1));
        let max_ms = self.max_delay.num_milliseconds();
        let delay_ms = self.start.num_milliseconds().saturating_mul(factor).min(max_ms);
        Duration::milliseconds(delay_ms)
    }
}

impl PaymentRetryPolicy for ExponentialRetryPolicy {
    fn name(&self) -> &str {
        "exponential"
    }

    fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        if ctx.attempt_number > self.max_retries {
            return RetryDecision::abort("exponential retries exhausted");
        }
        RetryDecision::retry_after(ctx.failed_at, self.delay_for_retry(ctx.attempt_number))
    }
}

/// Default policy for invoice payments: declines follow the day schedule,
/// gateway errors back off exponentially, unusable methods abort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceRetryPolicy {
    pub declines: FixedScheduleRetryPolicy,
    pub gateway_errors: ExponentialRetryPolicy,
}

impl PaymentRetryPolicy for InvoiceRetryPolicy {
    fn name(&self) -> &str {
        "invoice"
    }

    fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        match ctx.failure {
            PaymentFailure::Declined => self.declines.decide(ctx),
            PaymentFailure::GatewayError => self.gateway_errors.decide(ctx),
            PaymentFailure::NonRetryable => RetryDecision::abort("payment method unusable"),
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl PaymentRetryPolicy for NoRetryPolicy {
    fn name(&self) -> &str {
        "none"
    }

    fn decide(&self, _ctx: &RetryContext) -> RetryDecision {
        RetryDecision::abort("retries disabled")
    }
}

/// Policies keyed by name.
#[derive(Clone, Default)]
pub struct RetryPolicyRegistry {
    policies: HashMap<String, Arc<dyn PaymentRetryPolicy>>,
}

impl RetryPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in policies under their own names.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(InvoiceRetryPolicy::default()));
        registry.register(Arc::new(FixedScheduleRetryPolicy::default()));
        registry.register(Arc::new(ExponentialRetryPolicy::default()));
        registry.register(Arc::new(NoRetryPolicy));
        registry
    }

    /// Register under `policy.name()`, replacing any previous entry.
    pub fn register(&mut self, policy: Arc<dyn PaymentRetryPolicy>) {
        self.policies.insert(policy.name().to_string(), policy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PaymentRetryPolicy>> {
        self.policies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl core::fmt::Debug for RetryPolicyRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryPolicyRegistry")
            .field("policies", &self.names())
            .finish()
    }
}
