//! Named entry/exit hooks referenced by overdue state definitions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use duebill_core::AccountId;

/// Built-in hook that writes the transition to the log.
pub const LOG_HOOK: &str = "log";

/// Whether a hook runs because a state is being entered or left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Entry,
    Exit,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Entry => "entry",
            HookPhase::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub account_id: AccountId,
    pub phase: HookPhase,
    pub from_state: String,
    pub to_state: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

/// Side effect attached to a state transition. Runs after the new state
/// is persisted; failures are logged and do not undo the transition.
#[async_trait]
pub trait OverdueHook: Send + Sync {
    async fn run(&self, ctx: &HookContext) -> Result<(), HookError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogHook;

#[async_trait]
impl OverdueHook for LogHook {
    async fn run(&self, ctx: &HookContext) -> Result<(), HookError> {
        tracing::info!(
            account_id = %ctx.account_id,
            phase = ctx.phase.as_str(),
            from = %ctx.from_state,
            to = %ctx.to_state,
            "overdue state transition"
        );
        Ok(())
    }
}

/// Hooks by name. State sets are validated against it at load time.
#[derive(Clone)]
pub struct OverdueHookRegistry {
    hooks: HashMap<String, Arc<dyn OverdueHook>>,
}

impl Default for OverdueHookRegistry {
    fn default() -> Self {
        let mut registry = Self {
            hooks: HashMap::new(),
        };
        registry.register(LOG_HOOK, Arc::new(LogHook));
        registry
    }
}

impl OverdueHookRegistry {
    /// Registry holding the built-in `log` hook.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn OverdueHook>) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn with(mut self, name: impl Into<String>, hook: Arc<dyn OverdueHook>) -> Self {
        self.register(name, hook);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OverdueHook>> {
        self.hooks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.hooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for OverdueHookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverdueHookRegistry")
            .field("hooks", &self.names())
            .finish()
    }
}
