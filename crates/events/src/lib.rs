//! Billing domain events consumed by the deferred-work core.
//!
//! Producers (invoicing, payments, account management) hand these to the
//! ingress explicitly at the point they happen; no bus is assumed.

pub mod billing;
pub mod event;

pub use billing::BillingEvent;
pub use event::Event;
