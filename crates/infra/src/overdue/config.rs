//! Active overdue configuration.
//!
//! The loaded [`StateSet`] is immutable. Reloading validates the new document
//! completely, then swaps the pointer; readers keep the `Arc` they took, so
//! a refresh never sees half of one set and half of another.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use duebill_overdue::{ConfigError, StateSet};
use tracing::{info, warn};

use super::hooks::OverdueHookRegistry;

/// Shared holder of the current state set. Empty until a set is loaded.
#[derive(Debug, Default)]
pub struct StateSetHandle {
    current: RwLock<Option<Arc<StateSet>>>,
    last_version: AtomicU64,
}

impl StateSetHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the active set, if any.
    pub fn current(&self) -> Option<Arc<StateSet>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// Parse, validate (including hook names) and activate a JSON document.
    /// On error the previously active set stays in place.
    pub fn load_json(
        &self,
        json: &str,
        hooks: &OverdueHookRegistry,
    ) -> Result<Arc<StateSet>, ConfigError> {
        // Each load reserves its own version; rejected loads leave a gap
        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        let parsed = StateSet::from_json(version, json).and_then(|set| {
            set.validate_hooks(|name| hooks.contains(name))?;
            self.install(set)
        });

        match parsed {
            Ok(set) => Ok(set),
            Err(e) => {
                warn!(error = %e, "rejected overdue configuration, keeping previous");
                Err(e)
            }
        }
    }

    /// Read and activate a JSON document from disk.
    pub fn load_file(
        &self,
        path: impl AsRef<Path>,
        hooks: &OverdueHookRegistry,
    ) -> Result<Arc<StateSet>, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Malformed(format!("cannot read {}: {e}", path.display())))?;
        self.load_json(&json, hooks)
    }

    /// Activate an already validated set. Fails with `StaleVersion` unless
    /// the set is newer than the active one.
    pub fn install(&self, set: StateSet) -> Result<Arc<StateSet>, ConfigError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = current.as_ref() {
            if set.version() <= active.version() {
                return Err(ConfigError::StaleVersion {
                    offered: set.version(),
                    active: active.version(),
                });
            }
        }
        let set = Arc::new(set);
        self.last_version.fetch_max(set.version(), Ordering::SeqCst);
        *current = Some(set.clone());
        info!(
            version = set.version(),
            states = set.states().len(),
            "overdue configuration activated"
        );
        Ok(set)
    }
}
