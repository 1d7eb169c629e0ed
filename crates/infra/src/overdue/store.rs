//! Per-account overdue state persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use duebill_core::{AccountId, ExpectedVersion};
use duebill_overdue::OverdueState;

use crate::error::StoreError;

/// Versioned storage of [`OverdueState`] records.
///
/// `save` is a conditional write: it fails with `StoreError::Conflict` when
/// the stored version does not match `expected`. The stored record takes
/// `state.version`.
#[async_trait]
pub trait OverdueStateStore: Send + Sync {
    async fn get(&self, account_id: AccountId) -> Result<Option<OverdueState>, StoreError>;

    async fn save(&self, state: &OverdueState, expected: ExpectedVersion) -> Result<(), StoreError>;
}

/// In-memory overdue state store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOverdueStateStore {
    states: Mutex<HashMap<AccountId, OverdueState>>,
}

impl InMemoryOverdueStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverdueStateStore for InMemoryOverdueStateStore {
    async fn get(&self, account_id: AccountId) -> Result<Option<OverdueState>, StoreError> {
        let states = self.states.lock().map_err(|_| StoreError::poisoned())?;
        Ok(states.get(&account_id).cloned())
    }

    async fn save(
        &self,
        state: &OverdueState,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let mut states = self.states.lock().map_err(|_| StoreError::poisoned())?;
        let actual = states.get(&state.account_id).map(|s| s.version);
        expected
            .check(actual)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        states.insert(state.account_id, state.clone());
        Ok(())
    }
}
