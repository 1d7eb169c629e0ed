use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use duebill_core::AccountId;

use crate::state_set::{BlockFlags, CLEAR_STATE};

/// Recorded overdue status of one account.
///
/// `version` is the optimistic concurrency counter of the stored record;
/// 0 means nothing has been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueState {
    pub account_id: AccountId,
    pub state_name: String,
    /// Version of the state set that produced this state (0 = none loaded).
    pub state_set_version: u64,
    pub blocked: BlockFlags,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl OverdueState {
    /// Initial state of every account.
    pub fn clear(account_id: AccountId) -> Self {
        Self {
            account_id,
            state_name: CLEAR_STATE.to_string(),
            state_set_version: 0,
            blocked: BlockFlags::none(),
            last_transition_at: None,
            version: 0,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.state_name == CLEAR_STATE
    }

    /// Next record after a transition, one version up.
    pub fn advance(
        &self,
        state_name: impl Into<String>,
        blocked: BlockFlags,
        state_set_version: u64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: self.account_id,
            state_name: state_name.into(),
            state_set_version,
            blocked,
            last_transition_at: Some(at),
            version: self.version + 1,
        }
    }
}
