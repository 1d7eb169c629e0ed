//! Infrastructure layer of the billing core: the durable work queue and its
//! dispatcher, the overdue and payment retry runtimes, event ingress and the
//! service object wiring them together.

pub mod billing;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod ingress;
pub mod overdue;
pub mod queue;
pub mod retry;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use billing::{BillingDateHandler, BillingDatePayload, BILLING_DATE_QUEUE};
pub use collaborators::{
    AccountFactsSource, AttemptResult, CollaboratorError, EntitlementGate, InvoiceGenerator,
    LoggingEntitlementGate, PaymentAttemptExecutor, PaymentRequest,
};
pub use config::{ConfigLoadError, CoreConfig};
pub use error::StoreError;
pub use ingress::EventIngress;
pub use service::{BillingCoreService, CoreDependencies, ServiceError};
