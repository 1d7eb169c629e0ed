//! Service object owning the wiring of one billing core process.
//!
//! `BillingCoreService::start` builds the handler registry, loads the
//! overdue configuration, and spawns the dispatcher. `shutdown` stops
//! polling and waits for in-flight handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use duebill_core::AccountId;
use duebill_overdue::{ConfigError, OverdueState};
use duebill_payments::RetryPolicyRegistry;

use crate::billing::{BillingDateHandler, BILLING_DATE_QUEUE};
use crate::collaborators::{
    AccountFactsSource, EntitlementGate, InvoiceGenerator, PaymentAttemptExecutor,
};
use crate::config::CoreConfig;
use crate::error::StoreError;
use crate::ingress::EventIngress;
use crate::overdue::{
    InMemoryOverdueStateStore, OverdueEngine, OverdueError, OverdueHookRegistry,
    OverdueRefreshHandler, OverdueStateStore, PostgresOverdueStateStore, StateSetHandle,
    OVERDUE_REFRESH_QUEUE,
};
use crate::queue::{
    DeadLetterSink, Dispatcher, DispatcherHandle, DispatcherStats, HandlerRegistry,
    InMemoryWorkItemStore, OwnerKey, PostgresWorkItemStore, QueueName, WorkItemId, WorkItemStore,
};
use crate::retry::{
    InMemoryRetryAttemptStore, PaymentRetryHandler, PostgresRetryAttemptStore, RetryAttemptStore,
    RetryController, PAYMENT_RETRY_QUEUE,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown payment retry policy '{0}'")]
    UnknownPolicy(String),

    #[error("overdue configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

/// Stores and collaborators the core runs against.
pub struct CoreDependencies {
    pub work: Arc<dyn WorkItemStore>,
    pub overdue_states: Arc<dyn OverdueStateStore>,
    pub retry_attempts: Arc<dyn RetryAttemptStore>,
    pub facts: Arc<dyn AccountFactsSource>,
    pub gate: Arc<dyn EntitlementGate>,
    pub executor: Arc<dyn PaymentAttemptExecutor>,
    pub invoices: Arc<dyn InvoiceGenerator>,
    pub hooks: OverdueHookRegistry,
    pub policies: RetryPolicyRegistry,
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl CoreDependencies {
    /// Process-local stores; state is lost on restart.
    pub fn in_memory(
        facts: Arc<dyn AccountFactsSource>,
        gate: Arc<dyn EntitlementGate>,
        executor: Arc<dyn PaymentAttemptExecutor>,
        invoices: Arc<dyn InvoiceGenerator>,
    ) -> Self {
        Self {
            work: InMemoryWorkItemStore::arc(),
            overdue_states: Arc::new(InMemoryOverdueStateStore::new()),
            retry_attempts: Arc::new(InMemoryRetryAttemptStore::new()),
            facts,
            gate,
            executor,
            invoices,
            hooks: OverdueHookRegistry::default(),
            policies: RetryPolicyRegistry::with_defaults(),
            dead_letters: None,
        }
    }

    /// Stores backed by the tables in `migrations/0001_deferred_work.sql`.
    pub fn postgres(
        pool: PgPool,
        facts: Arc<dyn AccountFactsSource>,
        gate: Arc<dyn EntitlementGate>,
        executor: Arc<dyn PaymentAttemptExecutor>,
        invoices: Arc<dyn InvoiceGenerator>,
    ) -> Self {
        Self {
            work: Arc::new(PostgresWorkItemStore::new(pool.clone())),
            overdue_states: Arc::new(PostgresOverdueStateStore::new(pool.clone())),
            retry_attempts: Arc::new(PostgresRetryAttemptStore::new(pool)),
            ..Self::in_memory(facts, gate, executor, invoices)
        }
    }

    pub fn with_hooks(mut self, hooks: OverdueHookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_policies(mut self, policies: RetryPolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }
}

pub struct BillingCoreService {
    work: Arc<dyn WorkItemStore>,
    engine: Arc<OverdueEngine>,
    controller: Arc<RetryController>,
    state_sets: Arc<StateSetHandle>,
    hooks: Arc<OverdueHookRegistry>,
    ingress: EventIngress,
    dispatcher: Dispatcher,
    running: Option<DispatcherHandle>,
}

impl BillingCoreService {
    /// Wire everything without starting the polling loop.
    pub fn build(deps: CoreDependencies, config: &CoreConfig) -> Result<Self, ServiceError> {
        let policy = deps
            .policies
            .get(&config.retry_policy)
            .ok_or_else(|| ServiceError::UnknownPolicy(config.retry_policy.clone()))?;

        let hooks = Arc::new(deps.hooks);
        let state_sets = Arc::new(StateSetHandle::new());
        if let Some(path) = &config.state_set_path {
            state_sets.load_file(path, &hooks)?;
        } else {
            info!("no overdue configuration given, every account stays clear");
        }

        let engine = Arc::new(
            OverdueEngine::new(
                deps.overdue_states,
                deps.work.clone(),
                deps.facts,
                deps.gate,
                state_sets.clone(),
            )
            .with_hooks(hooks.clone())
            .with_max_conflict_retries(config.max_conflict_retries),
        );
        let controller = Arc::new(
            RetryController::new(deps.retry_attempts, deps.work.clone(), policy)
                .with_max_attempts(config.payment_max_attempts),
        );

        let registry = HandlerRegistry::new()
            .with(OVERDUE_REFRESH_QUEUE, Arc::new(OverdueRefreshHandler::new(engine.clone())))
            .with(
                PAYMENT_RETRY_QUEUE,
                Arc::new(PaymentRetryHandler::new(
                    controller.clone(),
                    deps.executor,
                    engine.clone(),
                    deps.work.clone(),
                )),
            )
            .with(
                BILLING_DATE_QUEUE,
                Arc::new(BillingDateHandler::new(deps.invoices, deps.work.clone())),
            );

        let mut dispatcher =
            Dispatcher::new(deps.work.clone(), registry, config.dispatcher_config());
        if let Some(sink) = deps.dead_letters {
            dispatcher = dispatcher.with_dead_letter_sink(sink);
        }

        Ok(Self {
            ingress: EventIngress::new(deps.work.clone()),
            work: deps.work,
            engine,
            controller,
            state_sets,
            hooks,
            dispatcher,
            running: None,
        })
    }

    /// Build and spawn the dispatcher. Must be called inside a tokio runtime.
    pub async fn start(deps: CoreDependencies, config: CoreConfig) -> Result<Self, ServiceError> {
        let mut service = Self::build(deps, &config)?;
        service.running = Some(service.dispatcher.clone().spawn());
        info!(
            dispatcher = %config.dispatcher_name,
            retry_policy = service.controller.policy_name(),
            "billing core started"
        );
        Ok(service)
    }

    /// Stop polling and wait for claimed items to settle.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.running.take() {
            handle.shutdown().await;
        }
        info!(stats = ?self.dispatcher.stats(), "billing core stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn enqueue(
        &self,
        queue: impl Into<QueueName>,
        owner_key: impl Into<OwnerKey>,
        effective_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<WorkItemId, StoreError> {
        self.ingress.enqueue(queue, owner_key, effective_at, payload).await
    }

    /// Re-evaluate one account immediately, outside the queue.
    pub async fn refresh(&self, account_id: AccountId) -> Result<OverdueState, OverdueError> {
        self.engine.refresh(account_id, Utc::now()).await
    }

    /// Replace the overdue configuration. The active one stays on error.
    pub fn reload_state_set(&self, json: &str) -> Result<u64, ConfigError> {
        Ok(self.state_sets.load_json(json, &self.hooks)?.version())
    }

    pub fn ingress(&self) -> &EventIngress {
        &self.ingress
    }

    pub fn engine(&self) -> &Arc<OverdueEngine> {
        &self.engine
    }

    pub fn retries(&self) -> &Arc<RetryController> {
        &self.controller
    }

    pub fn work(&self) -> &Arc<dyn WorkItemStore> {
        &self.work
    }

    /// The dispatcher, for driving polls by hand.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }
}

impl std::fmt::Debug for BillingCoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingCoreService")
            .field("engine", &self.engine)
            .field("controller", &self.controller)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}
