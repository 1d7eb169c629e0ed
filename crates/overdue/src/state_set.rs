//! Declarative overdue configuration.
//!
//! A [`StateSet`] is an ordered list of states plus the implicit
//! [`CLEAR_STATE`]. It is validated once when loaded and never mutated
//! afterwards; a reload builds a whole new set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::Condition;
use crate::facts::AccountFacts;

/// Name of the implicit state of accounts with no overdue condition.
pub const CLEAR_STATE: &str = "clear";

/// Longest accepted re-evaluation interval, in days.
pub const MAX_REEVALUATION_DAYS: u64 = 3650;

/// Restrictions applied to an account while it sits in a state.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockFlags {
    /// Plan/subscription changes are refused.
    pub block_changes: bool,
    /// Entitlements are suspended.
    pub block_entitlement: bool,
    /// Automatic payment attempts (including retries) are suspended.
    pub disable_auto_pay: bool,
}

impl BlockFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            block_changes: true,
            block_entitlement: true,
            disable_auto_pay: true,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.block_changes || self.block_entitlement || self.disable_auto_pay
    }
}

/// Duration expressed the way configuration authors write it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeSpan {
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

impl TimeSpan {
    pub fn days(days: u32) -> Self {
        Self {
            days,
            ..Default::default()
        }
    }

    pub fn to_duration(self) -> chrono::Duration {
        chrono::Duration::days(self.days as i64)
            + chrono::Duration::hours(self.hours as i64)
            + chrono::Duration::minutes(self.minutes as i64)
    }

    pub fn is_zero(&self) -> bool {
        self.days == 0 && self.hours == 0 && self.minutes == 0
    }

    pub fn total_minutes(&self) -> u64 {
        u64::from(self.days) * 24 * 60 + u64::from(self.hours) * 60 + u64::from(self.minutes)
    }

    /// `at` plus this span, or `None` past the representable range.
    pub fn after(self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        at.checked_add_signed(self.to_duration())
    }
}

/// One configured overdue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverdueStateDef {
    pub name: String,
    pub condition: Condition,
    #[serde(default)]
    pub actions: BlockFlags,
    /// Re-check interval while the account stays in this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reevaluation_interval: Option<TimeSpan>,
    /// Message shown to the account holder while in this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_message: Option<String>,
    /// Named hooks run after entering the state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<String>,
    /// Named hooks run after leaving the state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<String>,
}

impl OverdueStateDef {
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            condition,
            actions: BlockFlags::none(),
            reevaluation_interval: None,
            external_message: None,
            on_entry: Vec::new(),
            on_exit: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: BlockFlags) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_reevaluation(mut self, interval: TimeSpan) -> Self {
        self.reevaluation_interval = Some(interval);
        self
    }

    pub fn with_external_message(mut self, message: impl Into<String>) -> Self {
        self.external_message = Some(message.into());
        self
    }
}

/// Invalid overdue configuration. The previously loaded set stays active.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed state set: {0}")]
    Malformed(String),
    #[error("state at position {0} has an empty name")]
    EmptyName(usize),
    #[error("duplicate state name: {0}")]
    DuplicateName(String),
    #[error("state name '{0}' is reserved for the implicit clear state")]
    ReservedName(String),
    #[error("state '{0}' has no condition criteria and would match every account")]
    EmptyCondition(String),
    #[error("state '{0}' has a zero re-evaluation interval")]
    ZeroInterval(String),
    #[error("state '{0}' has a re-evaluation interval above {MAX_REEVALUATION_DAYS} days")]
    IntervalTooLong(String),
    #[error("state '{state}' references unknown hook '{hook}'")]
    UnknownHook { state: String, hook: String },
    #[error("state set version {offered} is not newer than active version {active}")]
    StaleVersion { offered: u64, active: u64 },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateSetDocument {
    states: Vec<OverdueStateDef>,
}

/// Validated, immutable overdue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSet {
    version: u64,
    states: Vec<OverdueStateDef>,
}

/// Outcome of evaluating a [`StateSet`] against account facts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    Clear,
    State(&'a OverdueStateDef),
}

impl<'a> Resolution<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Resolution::Clear => CLEAR_STATE,
            Resolution::State(def) => &def.name,
        }
    }

    pub fn actions(&self) -> BlockFlags {
        match self {
            Resolution::Clear => BlockFlags::none(),
            Resolution::State(def) => def.actions,
        }
    }

    pub fn definition(&self) -> Option<&'a OverdueStateDef> {
        match self {
            Resolution::Clear => None,
            Resolution::State(def) => Some(def),
        }
    }
}

impl StateSet {
    /// Validate `states` (in priority order) into a set tagged with `version`.
    pub fn try_new(version: u64, states: Vec<OverdueStateDef>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for (idx, state) in states.iter().enumerate() {
            let name = state.name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyName(idx));
            }
            if name.eq_ignore_ascii_case(CLEAR_STATE) {
                return Err(ConfigError::ReservedName(state.name.clone()));
            }
            if !seen.insert(state.name.clone()) {
                return Err(ConfigError::DuplicateName(state.name.clone()));
            }
            if state.condition.is_empty() {
                return Err(ConfigError::EmptyCondition(state.name.clone()));
            }
            if let Some(interval) = state.reevaluation_interval {
                if interval.is_zero() {
                    return Err(ConfigError::ZeroInterval(state.name.clone()));
                }
                if interval.total_minutes() > MAX_REEVALUATION_DAYS * 24 * 60 {
                    return Err(ConfigError::IntervalTooLong(state.name.clone()));
                }
            }
        }
        Ok(Self { version, states })
    }

    /// Parse a JSON document of the form `{"states": [...]}`.
    pub fn from_json(version: u64, json: &str) -> Result<Self, ConfigError> {
        let doc: StateSetDocument =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Self::try_new(version, doc.states)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn states(&self) -> &[OverdueStateDef] {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&OverdueStateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    /// First state (in priority order) whose condition holds, else clear.
    pub fn resolve(&self, facts: &AccountFacts) -> Resolution<'_> {
        self.states
            .iter()
            .find(|s| s.condition.matches(facts))
            .map_or(Resolution::Clear, Resolution::State)
    }

    /// Check every hook reference against the names the runtime knows about.
    pub fn validate_hooks(&self, is_known: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        for state in &self.states {
            for hook in state.on_entry.iter().chain(state.on_exit.iter()) {
                if !is_known(hook) {
                    return Err(ConfigError::UnknownHook {
                        state: state.name.clone(),
                        hook: hook.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tiered() -> StateSet {
        StateSet::try_new(
            1,
            vec![
                OverdueStateDef::new("A", Condition::days_overdue_at_least(50)),
                OverdueStateDef::new("B", Condition::days_overdue_at_least(40)),
                OverdueStateDef::new("C", Condition::days_overdue_at_least(30)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn first_matching_state_wins() {
        let set = tiered();
        assert_eq!(set.resolve(&AccountFacts::overdue(51, 10)).name(), "A");
        assert_eq!(set.resolve(&AccountFacts::overdue(45, 10)).name(), "B");
        assert_eq!(set.resolve(&AccountFacts::overdue(30, 10)).name(), "C");
        assert_eq!(set.resolve(&AccountFacts::overdue(29, 10)).name(), CLEAR_STATE);
    }

    #[test]
    fn declaration_order_beats_severity() {
        // C is declared first, so it shadows A for every account past 30 days.
        let set = StateSet::try_new(
            1,
            vec![
                OverdueStateDef::new("C", Condition::days_overdue_at_least(30)),
                OverdueStateDef::new("A", Condition::days_overdue_at_least(50)),
            ],
        )
        .unwrap();
        assert_eq!(set.resolve(&AccountFacts::overdue(51, 10)).name(), "C");
    }

    #[test]
    fn rejects_invalid_definitions() {
        let dup = StateSet::try_new(
            1,
            vec![
                OverdueStateDef::new("OD1", Condition::days_overdue_at_least(30)),
                OverdueStateDef::new("OD1", Condition::days_overdue_at_least(40)),
            ],
        );
        assert_eq!(dup.unwrap_err(), ConfigError::DuplicateName("OD1".into()));

        let reserved = StateSet::try_new(
            1,
            vec![OverdueStateDef::new("Clear", Condition::days_overdue_at_least(1))],
        );
        assert!(matches!(reserved, Err(ConfigError::ReservedName(_))));

        let empty = StateSet::try_new(1, vec![OverdueStateDef::new("OD1", Condition::default())]);
        assert_eq!(empty.unwrap_err(), ConfigError::EmptyCondition("OD1".into()));

        let blank = StateSet::try_new(
            1,
            vec![OverdueStateDef::new(" ", Condition::days_overdue_at_least(1))],
        );
        assert_eq!(blank.unwrap_err(), ConfigError::EmptyName(0));

        let zero = StateSet::try_new(
            1,
            vec![OverdueStateDef::new("OD1", Condition::days_overdue_at_least(1))
                .with_reevaluation(TimeSpan::default())],
        );
        assert!(matches!(zero, Err(ConfigError::ZeroInterval(_))));
    }

    #[test]
    fn rejects_intervals_beyond_ten_years() {
        let json = r#"{
            "states": [
                {
                    "name": "OD1",
                    "condition": { "days_overdue_at_least": 30 },
                    "reevaluation_interval": { "days": 1000000000 }
                }
            ]
        }"#;
        assert_eq!(
            StateSet::from_json(1, json).unwrap_err(),
            ConfigError::IntervalTooLong("OD1".into())
        );

        let hours = OverdueStateDef::new("OD1", Condition::days_overdue_at_least(1))
            .with_reevaluation(TimeSpan {
                days: 3650,
                hours: 1,
                minutes: 0,
            });
        assert!(matches!(
            StateSet::try_new(1, vec![hours]),
            Err(ConfigError::IntervalTooLong(_))
        ));

        let limit = OverdueStateDef::new("OD1", Condition::days_overdue_at_least(1))
            .with_reevaluation(TimeSpan::days(3650));
        assert!(StateSet::try_new(1, vec![limit]).is_ok());
    }

    #[test]
    fn parses_json_documents() {
        let json = r#"{
            "states": [
                {
                    "name": "OD2",
                    "condition": { "days_overdue_at_least": 60 },
                    "actions": {
                        "block_changes": true,
                        "block_entitlement": true,
                        "disable_auto_pay": true
                    },
                    "external_message": "Service suspended"
                },
                {
                    "name": "OD1",
                    "condition": { "days_overdue_at_least": 30, "tags_exclude": ["TEST"] },
                    "actions": { "block_changes": true },
                    "reevaluation_interval": { "days": 5 },
                    "on_entry": ["log"]
                }
            ]
        }"#;

        let set = StateSet::from_json(4, json).unwrap();
        assert_eq!(set.version(), 4);
        assert_eq!(set.states().len(), 2);
        let od1 = set.state("OD1").unwrap();
        assert!(od1.actions.block_changes);
        assert!(!od1.actions.block_entitlement);
        assert_eq!(od1.reevaluation_interval, Some(TimeSpan::days(5)));
        assert!(set.validate_hooks(|h| h == "log").is_ok());
        assert_eq!(
            set.validate_hooks(|_| false).unwrap_err(),
            ConfigError::UnknownHook { state: "OD1".into(), hook: "log".into() }
        );
    }

    #[test]
    fn malformed_condition_syntax_fails_fast() {
        let json = r#"{"states":[{"name":"OD1","condition":{"days_overdue":"thirty"}}]}"#;
        assert!(matches!(StateSet::from_json(1, json), Err(ConfigError::Malformed(_))));
    }

    proptest! {
        /// Property: resolution is a total function picking the first matching
        /// threshold, independent of anything but the facts.
        #[test]
        fn resolution_picks_first_matching_threshold(days in 0u32..400) {
            let set = tiered();
            let facts = AccountFacts::overdue(days, 100);
            let expected = if days >= 50 {
                "A"
            } else if days >= 40 {
                "B"
            } else if days >= 30 {
                "C"
            } else {
                CLEAR_STATE
            };
            prop_assert_eq!(set.resolve(&facts).name(), expected);
            prop_assert_eq!(set.resolve(&facts), set.resolve(&facts.clone()));
        }
    }
}
