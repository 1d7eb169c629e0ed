//! Payment retry rules.
//!
//! Retry attempts and the pluggable policies deciding whether a failed
//! payment is tried again. Pure domain logic; scheduling lives in infra.

pub mod attempt;
pub mod policy;

pub use attempt::{AttemptOutcome, RetryAttempt};
pub use policy::{
    ExponentialRetryPolicy, FixedScheduleRetryPolicy, InvoiceRetryPolicy, NoRetryPolicy,
    PaymentRetryPolicy, RetryContext, RetryDecision, RetryPolicyRegistry,
};
