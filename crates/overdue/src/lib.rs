//! Overdue (dunning) rules.
//!
//! Declarative state sets, condition evaluation over account facts and the
//! transition plan a refresh has to carry out. Deterministic domain logic
//! only: no IO, no clock, no storage.

pub mod condition;
pub mod facts;
pub mod state;
pub mod state_set;
pub mod transition;

pub use condition::Condition;
pub use facts::AccountFacts;
pub use state::OverdueState;
pub use state_set::{
    BlockFlags, ConfigError, OverdueStateDef, Resolution, StateSet, TimeSpan, CLEAR_STATE,
    MAX_REEVALUATION_DAYS,
};
pub use transition::{Transition, plan_transition};
