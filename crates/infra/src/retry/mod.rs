//! Payment retry runtime: attempt persistence, the policy controller and
//! the `payment.retry` queue handler.

pub mod controller;
pub mod handler;
pub mod postgres;
pub mod store;

/// Queue of payment attempts to run.
pub const PAYMENT_RETRY_QUEUE: &str = "payment.retry";

pub use controller::{PaymentRetryPayload, RetryController, RetryDirective, RetryError};
pub use handler::PaymentRetryHandler;
pub use postgres::PostgresRetryAttemptStore;
pub use store::{InMemoryRetryAttemptStore, RetryAttemptStore};
