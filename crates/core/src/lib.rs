//! `duebill-core`: shared building blocks for the deferred-work core.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod payment;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, InvoiceId, PaymentId};
pub use payment::PaymentFailure;
pub use version::ExpectedVersion;
