//! Transition planning.
//!
//! A refresh recomputes the target state from scratch and compares it with
//! the recorded one. Everything the runtime must do for the delta is captured
//! in a [`Transition`]; the steady case yields `None`.

use chrono::{DateTime, Utc};

use crate::facts::AccountFacts;
use crate::state::OverdueState;
use crate::state_set::{BlockFlags, StateSet};

/// Side effects owed for one state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: OverdueState,
    pub to: OverdueState,
    /// Hooks of the state being left (empty when the name did not change).
    pub exit_hooks: Vec<String>,
    /// Hooks of the state being entered (empty when the name did not change).
    pub entry_hooks: Vec<String>,
    /// New entitlement flags, when they differ from the recorded ones.
    pub entitlement_change: Option<BlockFlags>,
    /// When the new state wants the account re-checked.
    pub reevaluate_at: Option<DateTime<Utc>>,
}

impl Transition {
    pub fn changes_state(&self) -> bool {
        self.from.state_name != self.to.state_name
    }
}

/// Compute the transition from `current` given `facts`.
///
/// A missing state set resolves every account to clear (fail open).
pub fn plan_transition(
    current: &OverdueState,
    state_set: Option<&StateSet>,
    facts: &AccountFacts,
    now: DateTime<Utc>,
) -> Option<Transition> {
    let (resolution, set_version) = match state_set {
        Some(set) => (set.resolve(facts), set.version()),
        None => (crate::Resolution::Clear, 0),
    };

    let target_name = resolution.name();
    let target_flags = resolution.actions();
    let name_changed = current.state_name != target_name;

    if !name_changed && current.blocked == target_flags {
        return None;
    }

    let to = current.advance(target_name, target_flags, set_version, now);

    let (exit_hooks, entry_hooks) = if name_changed {
        let exit = state_set
            .and_then(|s| s.state(&current.state_name))
            .map(|d| d.on_exit.clone())
            .unwrap_or_default();
        let entry = resolution
            .definition()
            .map(|d| d.on_entry.clone())
            .unwrap_or_default();
        (exit, entry)
    } else {
        (Vec::new(), Vec::new())
    };

    let entitlement_change = (current.blocked != target_flags).then_some(target_flags);

    let reevaluate_at = if name_changed {
        resolution
            .definition()
            .and_then(|d| d.reevaluation_interval)
            .and_then(|i| i.after(now))
    } else {
        None
    };

    Some(Transition {
        from: current.clone(),
        to,
        exit_hooks,
        entry_hooks,
        entitlement_change,
        reevaluate_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Condition, OverdueStateDef, TimeSpan, CLEAR_STATE};
    use duebill_core::AccountId;

    fn dunning_set() -> StateSet {
        StateSet::try_new(
            3,
            vec![
                OverdueStateDef::new("OD2", Condition::days_overdue_at_least(60))
                    .with_actions(BlockFlags::all()),
                OverdueStateDef {
                    on_entry: vec!["notify".into()],
                    on_exit: vec!["log".into()],
                    ..OverdueStateDef::new("OD1", Condition::days_overdue_at_least(30))
                        .with_actions(BlockFlags {
                            block_changes: true,
                            ..Default::default()
                        })
                        .with_reevaluation(TimeSpan::days(5))
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn steady_state_plans_nothing() {
        let account = AccountId::new();
        let clear = OverdueState::clear(account);
        let settled = AccountFacts::settled();
        assert!(plan_transition(&clear, Some(&dunning_set()), &settled, Utc::now()).is_none());
        assert!(plan_transition(&clear, None, &AccountFacts::overdue(90, 1), Utc::now()).is_none());
    }

    #[test]
    fn entering_a_state_carries_its_side_effects() {
        let now = Utc::now();
        let set = dunning_set();
        let clear = OverdueState::clear(AccountId::new());

        let t = plan_transition(&clear, Some(&set), &AccountFacts::overdue(31, 500), now).unwrap();
        assert!(t.changes_state());
        assert_eq!(t.to.state_name, "OD1");
        assert_eq!(t.to.version, 1);
        assert_eq!(t.to.state_set_version, 3);
        assert_eq!(t.entry_hooks, vec!["notify".to_string()]);
        assert!(t.exit_hooks.is_empty());
        assert_eq!(t.entitlement_change, Some(set.state("OD1").unwrap().actions));
        assert_eq!(t.reevaluate_at, Some(now + chrono::Duration::days(5)));

        let back = plan_transition(&t.to, Some(&set), &AccountFacts::settled(), now).unwrap();
        assert_eq!(back.to.state_name, CLEAR_STATE);
        assert_eq!(back.exit_hooks, vec!["log".to_string()]);
        assert_eq!(back.entitlement_change, Some(BlockFlags::none()));
        assert!(back.reevaluate_at.is_none());
    }

    #[test]
    fn reevaluation_past_the_calendar_end_is_dropped() {
        let end = chrono::DateTime::<Utc>::MAX_UTC - chrono::Duration::days(1);
        let clear = OverdueState::clear(AccountId::new());
        let facts = AccountFacts::overdue(31, 500);
        let t = plan_transition(&clear, Some(&dunning_set()), &facts, end).unwrap();
        assert_eq!(t.to.state_name, "OD1");
        assert!(t.reevaluate_at.is_none());
    }

    #[test]
    fn reloaded_actions_update_entitlements_without_hooks() {
        let set = dunning_set();
        let mut recorded = OverdueState::clear(AccountId::new()).advance(
            "OD1",
            BlockFlags::none(),
            2,
            Utc::now(),
        );
        recorded.version = 4;

        let facts = AccountFacts::overdue(35, 1);
        let t = plan_transition(&recorded, Some(&set), &facts, Utc::now()).unwrap();
        assert!(!t.changes_state());
        assert!(t.entry_hooks.is_empty() && t.exit_hooks.is_empty());
        assert!(t.entitlement_change.is_some());
        assert_eq!(t.to.version, 5);
    }

    #[test]
    fn missing_config_releases_previous_blocks() {
        let recorded =
            OverdueState::clear(AccountId::new()).advance("OD2", BlockFlags::all(), 1, Utc::now());
        let facts = AccountFacts::overdue(90, 1);
        let t = plan_transition(&recorded, None, &facts, Utc::now()).unwrap();
        assert_eq!(t.to.state_name, CLEAR_STATE);
        assert_eq!(t.entitlement_change, Some(BlockFlags::none()));
    }
}
