//! Overdue (dunning) runtime: state persistence, configuration holder,
//! hooks and the refresh engine driving [`duebill_overdue`] rules.

pub mod config;
pub mod engine;
pub mod handler;
pub mod hooks;
pub mod postgres;
pub mod store;

/// Queue of scheduled overdue re-evaluations.
pub const OVERDUE_REFRESH_QUEUE: &str = "overdue.refresh";

pub use config::StateSetHandle;
pub use engine::{OverdueEngine, OverdueError, OverdueRefreshPayload, OverdueStatus, Refreshed};
pub use handler::OverdueRefreshHandler;
pub use hooks::{
    HookContext, HookError, HookPhase, LogHook, OverdueHook, OverdueHookRegistry, LOG_HOOK,
};
pub use postgres::PostgresOverdueStateStore;
pub use store::{InMemoryOverdueStateStore, OverdueStateStore};
