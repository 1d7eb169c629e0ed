//! Overdue state machine runtime.
//!
//! A refresh recomputes the target state from the current facts and the
//! active state set, then writes it with an optimistic version check. A lost
//! race re-reads and recomputes; side effects run only once the write
//! succeeded, so they happen once per transition no matter how many
//! attempts the write took.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use duebill_core::{AccountId, ExpectedVersion};
use duebill_overdue::{plan_transition, AccountFacts, OverdueState, StateSet, Transition};

use crate::collaborators::{AccountFactsSource, CollaboratorError, EntitlementGate};
use crate::error::StoreError;
use crate::queue::{NewWorkItem, OwnerKey, QueueName, WorkItem, WorkItemStore};

use super::config::StateSetHandle;
use super::hooks::{HookContext, HookPhase, OverdueHookRegistry};
use super::OVERDUE_REFRESH_QUEUE;

/// Payload of `overdue.refresh` items.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverdueRefreshPayload {
    /// Why the refresh was scheduled; informational.
    #[serde(default)]
    pub reason: String,
}

impl OverdueRefreshPayload {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OverdueError {
    #[error("account facts unavailable: {0}")]
    Facts(#[source] CollaboratorError),
    #[error("entitlement gate failed: {0}")]
    Entitlement(#[source] CollaboratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("overdue state of account {account_id} kept changing after {retries} retries")]
    ConflictRetriesExhausted { account_id: AccountId, retries: u32 },
}

/// Result of a refresh with the information the queue handler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refreshed {
    pub state: OverdueState,
    /// Whether this call moved the account to a new state or new flags.
    pub transitioned: bool,
}

/// Read-only view of an account's overdue situation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueStatus {
    pub account_id: AccountId,
    pub state_name: String,
    pub blocked: duebill_overdue::BlockFlags,
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Message configured for the state, for display to the account holder.
    pub external_message: Option<String>,
    pub next_reevaluation_at: Option<DateTime<Utc>>,
}

pub struct OverdueEngine {
    states: Arc<dyn super::OverdueStateStore>,
    work: Arc<dyn WorkItemStore>,
    facts: Arc<dyn AccountFactsSource>,
    gate: Arc<dyn EntitlementGate>,
    hooks: Arc<OverdueHookRegistry>,
    config: Arc<StateSetHandle>,
    max_conflict_retries: u32,
}

impl OverdueEngine {
    pub fn new(
        states: Arc<dyn super::OverdueStateStore>,
        work: Arc<dyn WorkItemStore>,
        facts: Arc<dyn AccountFactsSource>,
        gate: Arc<dyn EntitlementGate>,
        config: Arc<StateSetHandle>,
    ) -> Self {
        Self {
            states,
            work,
            facts,
            gate,
            hooks: Arc::new(OverdueHookRegistry::new()),
            config,
            max_conflict_retries: 5,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<OverdueHookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn hooks(&self) -> &OverdueHookRegistry {
        &self.hooks
    }

    pub fn state_sets(&self) -> &StateSetHandle {
        &self.config
    }

    /// Fetch the account's facts and bring its overdue state up to date.
    pub async fn refresh(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<OverdueState, OverdueError> {
        Ok(self.refresh_detailed(account_id, now).await?.state)
    }

    pub async fn refresh_detailed(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Refreshed, OverdueError> {
        let facts = self.facts.get(account_id).await.map_err(OverdueError::Facts)?;
        self.refresh_with_facts(account_id, &facts, now).await
    }

    /// Bring the account's overdue state in line with `facts`.
    ///
    /// Idempotent: with unchanged facts and configuration the second call
    /// reads, finds nothing to do and returns the recorded state.
    #[instrument(skip(self, facts), fields(account_id = %account_id), err)]
    pub async fn refresh_with_facts(
        &self,
        account_id: AccountId,
        facts: &AccountFacts,
        now: DateTime<Utc>,
    ) -> Result<Refreshed, OverdueError> {
        for attempt in 0..=self.max_conflict_retries {
            let state_set = self.config.current();
            let current = self
                .states
                .get(account_id)
                .await?
                .unwrap_or_else(|| OverdueState::clear(account_id));

            let planned = plan_transition(&current, state_set.as_deref(), facts, now);
            let Some(transition) = planned else {
                debug!(state = %current.state_name, "overdue state unchanged");
                return Ok(Refreshed {
                    state: current,
                    transitioned: false,
                });
            };

            match self
                .states
                .save(&transition.to, ExpectedVersion::from_read(current.version))
                .await
            {
                Ok(()) => {
                    info!(
                        from = %transition.from.state_name,
                        to = %transition.to.state_name,
                        version = transition.to.version,
                        "overdue state changed"
                    );
                    self.apply(&transition, state_set.as_deref(), now).await?;
                    return Ok(Refreshed {
                        state: transition.to,
                        transitioned: true,
                    });
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(
                        attempt,
                        reason = %reason,
                        "overdue state write lost a race, recomputing"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(retries = self.max_conflict_retries, "giving up on contended overdue refresh");
        Err(OverdueError::ConflictRetriesExhausted {
            account_id,
            retries: self.max_conflict_retries,
        })
    }

    /// Non-terminal refresh items of an account, soonest first.
    pub async fn pending_refreshes(&self, owner: &OwnerKey) -> Result<Vec<WorkItem>, StoreError> {
        self.work
            .pending_for_owner(&QueueName::new(OVERDUE_REFRESH_QUEUE), owner)
            .await
    }

    /// Current recorded status plus what the configuration says about it.
    pub async fn status(&self, account_id: AccountId) -> Result<OverdueStatus, OverdueError> {
        let state = self
            .states
            .get(account_id)
            .await?
            .unwrap_or_else(|| OverdueState::clear(account_id));
        let external_message = self
            .config
            .current()
            .and_then(|set| set.state(&state.state_name).and_then(|d| d.external_message.clone()));
        let next_reevaluation_at = self
            .pending_refreshes(&OwnerKey::from(account_id))
            .await?
            .first()
            .map(|item| item.effective_at);

        Ok(OverdueStatus {
            account_id,
            state_name: state.state_name,
            blocked: state.blocked,
            last_transition_at: state.last_transition_at,
            external_message,
            next_reevaluation_at,
        })
    }

    /// Side effects of a persisted transition: exit hooks, drop stale
    /// re-evaluations, entitlement flags, entry hooks, next re-evaluation.
    async fn apply(
        &self,
        transition: &Transition,
        state_set: Option<&StateSet>,
        now: DateTime<Utc>,
    ) -> Result<(), OverdueError> {
        let account_id = transition.to.account_id;
        let owner = OwnerKey::from(account_id);
        let queue = QueueName::new(OVERDUE_REFRESH_QUEUE);

        self.run_hooks(&transition.exit_hooks, HookPhase::Exit, transition, now).await;

        if transition.changes_state() {
            match self.work.cancel_pending(&queue, &owner, now).await {
                Ok(0) => {}
                Ok(n) => debug!(cancelled = n, "dropped stale re-evaluations"),
                Err(e) => warn!(error = %e, "could not drop stale re-evaluations"),
            }
        }

        let mut gate_error = None;
        if let Some(flags) = transition.entitlement_change {
            if let Err(e) = self.gate.set_blocked(account_id, flags).await {
                gate_error = Some(e);
            }
        }

        self.run_hooks(&transition.entry_hooks, HookPhase::Entry, transition, now).await;

        if let Some(at) = transition.reevaluate_at {
            let item = NewWorkItem::new(
                queue,
                owner,
                at,
                serde_json::to_value(OverdueRefreshPayload::new("reevaluation"))
                    .unwrap_or_default(),
            );
            if let Err(e) = self.work.enqueue(item).await {
                warn!(error = %e, reevaluate_at = %at, "could not schedule re-evaluation");
            }
        }

        match gate_error {
            None => Ok(()),
            Some(e) => {
                self.revert_flags(transition, state_set, now).await;
                Err(OverdueError::Entitlement(e))
            }
        }
    }

    /// Record the previous flags again after the gate refused the new ones,
    /// so the next refresh sees a pending flag change and retries it.
    async fn revert_flags(
        &self,
        transition: &Transition,
        state_set: Option<&StateSet>,
        now: DateTime<Utc>,
    ) {
        let reverted = transition.to.advance(
            transition.to.state_name.clone(),
            transition.from.blocked,
            state_set.map_or(0, StateSet::version),
            now,
        );
        if let Err(e) = self
            .states
            .save(&reverted, ExpectedVersion::Exact(transition.to.version))
            .await
        {
            error!(
                account_id = %transition.to.account_id,
                error = %e,
                "could not record unapplied entitlement flags"
            );
        }
    }

    async fn run_hooks(
        &self,
        names: &[String],
        phase: HookPhase,
        transition: &Transition,
        now: DateTime<Utc>,
    ) {
        if names.is_empty() {
            return;
        }
        let ctx = HookContext {
            account_id: transition.to.account_id,
            phase,
            from_state: transition.from.state_name.clone(),
            to_state: transition.to.state_name.clone(),
            at: now,
        };
        for name in names {
            let Some(hook) = self.hooks.get(name) else {
                warn!(hook = %name, phase = phase.as_str(), "hook not registered, skipping");
                continue;
            };
            if let Err(e) = hook.run(&ctx).await {
                warn!(hook = %name, phase = phase.as_str(), error = %e, "overdue hook failed");
            }
        }
    }
}

impl std::fmt::Debug for OverdueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverdueEngine")
            .field("hooks", &self.hooks)
            .field("config", &self.config)
            .field("max_conflict_retries", &self.max_conflict_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overdue::{InMemoryOverdueStateStore, OverdueStateStore};
    use crate::overdue::hooks::{HookError, OverdueHook};
    use crate::queue::InMemoryWorkItemStore;
    use async_trait::async_trait;
    use duebill_overdue::BlockFlags;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const CONFIG: &str = r#"{
        "states": [
            {"name": "OD2", "condition": {"days_overdue_at_least": 60},
             "actions": {"block_changes": true, "block_entitlement": true,
                         "disable_auto_pay": true},
             "external_message": "Service suspended"},
            {"name": "OD1", "condition": {"days_overdue_at_least": 30},
             "actions": {"block_changes": true},
             "reevaluation_interval": {"days": 5},
             "on_entry": ["record"], "on_exit": ["record", "log"]}
        ]
    }"#;

    #[derive(Default)]
    struct Facts(Mutex<HashMap<AccountId, AccountFacts>>);

    impl Facts {
        fn set(&self, account: AccountId, facts: AccountFacts) {
            self.0.lock().unwrap().insert(account, facts);
        }
    }

    #[async_trait]
    impl AccountFactsSource for Facts {
        async fn get(&self, account_id: AccountId) -> Result<AccountFacts, CollaboratorError> {
            self.0
                .lock()
                .unwrap()
                .get(&account_id)
                .cloned()
                .ok_or(CollaboratorError::UnknownAccount(account_id))
        }
    }

    #[derive(Default)]
    struct Gate {
        calls: Mutex<Vec<BlockFlags>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EntitlementGate for Gate {
        async fn set_blocked(
            &self,
            _account: AccountId,
            flags: BlockFlags,
        ) -> Result<(), CollaboratorError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CollaboratorError::Unavailable("gate down".into()));
            }
            self.calls.lock().unwrap().push(flags);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(HookPhase, String, String)>>);

    #[async_trait]
    impl OverdueHook for Recorder {
        async fn run(&self, ctx: &HookContext) -> Result<(), HookError> {
            self.0
                .lock()
                .unwrap()
                .push((ctx.phase, ctx.from_state.clone(), ctx.to_state.clone()));
            Ok(())
        }
    }

    struct Fixture {
        engine: OverdueEngine,
        work: Arc<InMemoryWorkItemStore>,
        gate: Arc<Gate>,
        recorder: Arc<Recorder>,
    }

    fn fixture(states: Arc<dyn OverdueStateStore>, loaded: bool) -> Fixture {
        let work = InMemoryWorkItemStore::arc();
        let gate = Arc::new(Gate::default());
        let recorder = Arc::new(Recorder::default());
        let hooks = Arc::new(OverdueHookRegistry::new().with("record", recorder.clone()));
        let config = Arc::new(StateSetHandle::new());
        if loaded {
            config.load_json(CONFIG, &hooks).unwrap();
        }
        let facts = Arc::new(Facts::default());
        let engine =
            OverdueEngine::new(states, work.clone(), facts, gate.clone(), config).with_hooks(hooks);
        Fixture {
            engine,
            work,
            gate,
            recorder,
        }
    }

    fn refresh_queue() -> QueueName {
        QueueName::new(OVERDUE_REFRESH_QUEUE)
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let f = fixture(Arc::new(InMemoryOverdueStateStore::new()), true);
        let account = AccountId::new();
        let now = Utc::now();
        let facts = AccountFacts::overdue(31, 1_000);

        let first = f.engine.refresh_with_facts(account, &facts, now).await.unwrap();
        let second = f.engine.refresh_with_facts(account, &facts, now).await.unwrap();

        assert!(first.transitioned);
        assert!(!second.transitioned);
        assert_eq!(first.state, second.state);
        assert_eq!(f.gate.calls.lock().unwrap().len(), 1);
        assert_eq!(f.recorder.0.lock().unwrap().len(), 1);
        let pending = f
            .work
            .pending_for_owner(&refresh_queue(), &OwnerKey::from(account))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn transition_runs_hooks_and_schedules_reevaluation() {
        let f = fixture(Arc::new(InMemoryOverdueStateStore::new()), true);
        let account = AccountId::new();
        let now = Utc::now();

        let od1 = f
            .engine
            .refresh_with_facts(account, &AccountFacts::overdue(31, 1_000), now)
            .await
            .unwrap();
        assert_eq!(od1.state.state_name, "OD1");
        assert_eq!(
            od1.state.blocked,
            BlockFlags {
                block_changes: true,
                ..Default::default()
            }
        );

        let pending = f
            .work
            .pending_for_owner(&refresh_queue(), &OwnerKey::from(account))
            .await
            .unwrap();
        assert_eq!(pending[0].effective_at, now + chrono::Duration::days(5));

        let later = now + chrono::Duration::days(1);
        let od2 = f
            .engine
            .refresh_with_facts(account, &AccountFacts::overdue(61, 2_000), later)
            .await
            .unwrap();
        assert_eq!(od2.state.state_name, "OD2");
        assert_eq!(od2.state.version, 2);

        // OD2 has no interval and the OD1 re-check was dropped
        assert!(f
            .work
            .pending_for_owner(&refresh_queue(), &OwnerKey::from(account))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            *f.recorder.0.lock().unwrap(),
            vec![
                (HookPhase::Entry, "clear".to_string(), "OD1".to_string()),
                (HookPhase::Exit, "OD1".to_string(), "OD2".to_string()),
            ]
        );
        assert_eq!(*f.gate.calls.lock().unwrap().last().unwrap(), BlockFlags::all());

        let status = f.engine.status(account).await.unwrap();
        assert_eq!(status.state_name, "OD2");
        assert_eq!(status.external_message.as_deref(), Some("Service suspended"));
    }

    #[tokio::test]
    async fn missing_configuration_fails_open() {
        let f = fixture(Arc::new(InMemoryOverdueStateStore::new()), false);
        let account = AccountId::new();

        let result = f
            .engine
            .refresh_with_facts(account, &AccountFacts::overdue(365, 1_000_000), Utc::now())
            .await
            .unwrap();

        assert_eq!(result.state.state_name, "clear");
        assert!(!result.state.blocked.is_blocking());
        assert!(!result.transitioned);
        assert!(f.gate.calls.lock().unwrap().is_empty());
    }

    /// Store that lets a competing writer slip in before the first save.
    struct RacingStore {
        inner: InMemoryOverdueStateStore,
        raced: AtomicU32,
    }

    #[async_trait]
    impl OverdueStateStore for RacingStore {
        async fn get(&self, account_id: AccountId) -> Result<Option<OverdueState>, StoreError> {
            self.inner.get(account_id).await
        }

        async fn save(
            &self,
            state: &OverdueState,
            expected: ExpectedVersion,
        ) -> Result<(), StoreError> {
            if self.raced.fetch_add(1, Ordering::SeqCst) == 0 {
                let competitor = OverdueState::clear(state.account_id).advance(
                    "OD1",
                    BlockFlags {
                        block_changes: true,
                        ..Default::default()
                    },
                    1,
                    Utc::now(),
                );
                self.inner.save(&competitor, ExpectedVersion::Absent).await?;
            }
            self.inner.save(state, expected).await
        }
    }

    #[tokio::test]
    async fn lost_race_is_recomputed_without_duplicate_effects() {
        let store = Arc::new(RacingStore {
            inner: InMemoryOverdueStateStore::new(),
            raced: AtomicU32::new(0),
        });
        let f = fixture(store.clone(), true);
        let account = AccountId::new();

        let result = f
            .engine
            .refresh_with_facts(account, &AccountFacts::overdue(31, 1_000), Utc::now())
            .await
            .unwrap();

        // The competitor already wrote OD1; the recompute finds nothing left to do
        assert_eq!(result.state.state_name, "OD1");
        assert!(!result.transitioned);
        assert!(f.gate.calls.lock().unwrap().is_empty());
        assert_eq!(store.raced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_entitlement_change_is_retried_on_next_refresh() {
        let f = fixture(Arc::new(InMemoryOverdueStateStore::new()), true);
        f.gate.failures_left.store(1, Ordering::SeqCst);
        let account = AccountId::new();
        let facts = AccountFacts::overdue(31, 1_000);

        let err = f.engine.refresh_with_facts(account, &facts, Utc::now()).await.unwrap_err();
        assert!(matches!(err, OverdueError::Entitlement(_)));

        let retried = f.engine.refresh_with_facts(account, &facts, Utc::now()).await.unwrap();
        assert!(retried.transitioned);
        assert_eq!(retried.state.state_name, "OD1");
        assert_eq!(f.gate.calls.lock().unwrap().len(), 1);
        // Entry hooks ran once, with the state change
        assert_eq!(f.recorder.0.lock().unwrap().len(), 1);
    }
}
