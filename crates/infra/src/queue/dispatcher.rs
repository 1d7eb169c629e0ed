//! Queue dispatcher: claim due items, run handlers, settle outcomes.
//!
//! One polling task per dispatcher. Each cycle claims a batch per queue,
//! runs the handlers on a bounded pool (tokio tasks gated by a semaphore),
//! waits for the whole batch, then sleeps. Handler failures are counted
//! against a [`BackoffPolicy`]; storage failures never reach handlers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;

use super::registry::{HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry};
use super::store::WorkItemStore;
use super::types::{BackoffPolicy, QueueName, WorkItem};

/// Settlement writes are retried this many times before the item is left
/// to lease expiry.
const SETTLE_ATTEMPTS: u32 = 3;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging; also the claim owner written to the store.
    /// Must be unique among dispatchers sharing a store.
    pub name: String,
    /// How often to poll for due items
    pub poll_interval: Duration,
    /// How long a claim stays exclusive
    pub lease_duration: Duration,
    /// Maximum items claimed per queue per cycle
    pub batch_size: usize,
    /// Maximum handlers running at once
    pub max_concurrent: usize,
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
    /// Handler retry budget
    pub backoff: BackoffPolicy,
    /// Initial sleep after a failed claim
    pub storage_backoff_base: Duration,
    /// Cap for the claim failure sleep
    pub storage_backoff_max: Duration,
    /// Queues to poll; empty means every registered queue
    pub queues: Vec<QueueName>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: format!("dispatcher-{}", uuid::Uuid::now_v7()),
            poll_interval: Duration::from_secs(2),
            lease_duration: Duration::from_secs(300),
            batch_size: 16,
            max_concurrent: 4,
            handler_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            storage_backoff_base: Duration::from_millis(500),
            storage_backoff_max: Duration::from_secs(60),
            queues: Vec::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueName>) -> Self {
        self.queues = queues;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub polls: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub rescheduled: u64,
    pub released: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub poisoned: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub storage_errors: u64,
    /// Settles dropped because the claim had passed to another dispatcher
    pub lost_claims: u64,
}

/// Receives items that exhausted their attempts or failed permanently.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_lettered(&self, item: &WorkItem, reason: &str);
}

/// Default sink: an error log line per dead letter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn dead_lettered(&self, item: &WorkItem, reason: &str) {
        error!(
            item_id = %item.id,
            queue = %item.queue,
            owner_key = %item.owner_key,
            attempts = item.attempts + 1,
            reason,
            "work item dead-lettered"
        );
    }
}

/// Final write for a handled item.
#[derive(Debug, Clone, PartialEq)]
enum Settlement {
    Complete,
    Release,
    Reschedule(DateTime<Utc>),
    RecordFailure { error: String, retry_at: DateTime<Utc> },
    DeadLetter(String),
}

impl Settlement {
    fn name(&self) -> &'static str {
        match self {
            Settlement::Complete => "complete",
            Settlement::Release => "release",
            Settlement::Reschedule(_) => "reschedule",
            Settlement::RecordFailure { .. } => "record_failure",
            Settlement::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Polls a work item store and runs registered handlers.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn WorkItemStore>,
    registry: Arc<HandlerRegistry>,
    config: Arc<DispatcherConfig>,
    sink: Arc<dyn DeadLetterSink>,
    stats: Arc<Mutex<DispatcherStats>>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            registry: Arc::new(registry),
            config: Arc::new(config),
            sink: Arc::new(LoggingDeadLetterSink),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
            permits,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run one cycle at the current time.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        self.poll_at(Utc::now()).await
    }

    /// Run one cycle as if the clock read `now`. Returns the number of items
    /// claimed. Claim failures on one queue do not stop the others; the first
    /// error is returned after all queues were polled.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.bump(|s| s.polls += 1);

        let mut first_error = None;
        let mut claimed_total = 0;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for queue in self.queues() {
            let items = match self
                .store
                .claim_due(
                    &queue,
                    now,
                    self.config.lease_duration,
                    self.config.batch_size,
                    &self.config.name,
                )
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    warn!(
                        dispatcher = %self.config.name,
                        queue = %queue,
                        error = %e,
                        "claim failed"
                    );
                    self.bump(|s| s.storage_errors += 1);
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            if !items.is_empty() {
                debug!(
                    dispatcher = %self.config.name,
                    queue = %queue,
                    count = items.len(),
                    "claimed work items"
                );
            }
            claimed_total += items.len();
            self.bump(|s| s.claimed += items.len() as u64);

            for item in items {
                let Ok(permit) = self.permits.clone().acquire_owned().await else {
                    break;
                };
                let this = self.clone();
                tasks.push(tokio::spawn(async move {
                    this.process(item, now).await;
                    drop(permit);
                }));
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!(dispatcher = %self.config.name, error = %e, "work item task aborted");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(claimed_total),
        }
    }

    /// Spawn the polling loop.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            dispatcher = %self.config.name,
            queues = ?self.queues(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        let mut storage_backoff: Option<Duration> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.poll_once().await {
                Ok(_) => {
                    storage_backoff = None;
                    self.config.poll_interval
                }
                Err(e) => {
                    let next = next_storage_backoff(
                        storage_backoff,
                        self.config.storage_backoff_base,
                        self.config.storage_backoff_max,
                    );
                    error!(
                        dispatcher = %self.config.name,
                        error = %e,
                        backoff_ms = next.as_millis() as u64,
                        "storage unavailable, backing off"
                    );
                    storage_backoff = Some(next);
                    next
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(dispatcher = %self.config.name, "dispatcher stopped");
    }

    fn queues(&self) -> Vec<QueueName> {
        if self.config.queues.is_empty() {
            self.registry.queues()
        } else {
            self.config.queues.clone()
        }
    }

    async fn process(&self, item: WorkItem, now: DateTime<Utc>) {
        let Some(handler) = self.registry.get(&item.queue) else {
            warn!(
                item_id = %item.id,
                queue = %item.queue,
                "no handler registered, dropping poison item"
            );
            self.bump(|s| s.poisoned += 1);
            self.settle(&item, Settlement::Complete).await;
            return;
        };

        let owner_cancelled = match self.store.is_owner_cancelled(&item.owner_key).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                // Leave it to lease expiry rather than act on unknown state
                warn!(item_id = %item.id, error = %e, "cancellation lookup failed");
                self.bump(|s| s.storage_errors += 1);
                return;
            }
        };

        let ctx = HandlerContext {
            now,
            attempt: item.attempts,
            owner_cancelled,
            dispatcher: self.config.name.clone(),
        };

        let timeout = self.config.handler_timeout;
        let task_item = item.clone();
        let result = tokio::spawn(async move {
            tokio::time::timeout(timeout, handler.handle(&task_item, &ctx)).await
        })
        .await;

        let settlement = match result {
            Ok(Ok(Ok(HandlerOutcome::Done))) => {
                self.bump(|s| s.succeeded += 1);
                Settlement::Complete
            }
            Ok(Ok(Ok(HandlerOutcome::RescheduleAt(at)))) => {
                self.bump(|s| s.rescheduled += 1);
                Settlement::Reschedule(at)
            }
            Ok(Ok(Ok(HandlerOutcome::Release))) => {
                self.bump(|s| s.released += 1);
                Settlement::Release
            }
            Ok(Ok(Err(HandlerError::Permanent(reason)))) => {
                warn!(
                    item_id = %item.id,
                    queue = %item.queue,
                    reason = %reason,
                    "permanent handler failure"
                );
                self.dead_letter_settlement(reason)
            }
            Ok(Ok(Err(HandlerError::Transient(reason)))) => {
                self.failure_settlement(&item, reason, now)
            }
            Ok(Err(_elapsed)) => {
                self.bump(|s| s.timeouts += 1);
                let reason = format!("handler timed out after {}ms", timeout.as_millis());
                self.failure_settlement(&item, reason, now)
            }
            Err(join_err) => {
                self.bump(|s| s.panics += 1);
                let reason = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    format!("handler task failed: {join_err}")
                };
                self.failure_settlement(&item, reason, now)
            }
        };

        self.settle(&item, settlement).await;
    }

    fn failure_settlement(
        &self,
        item: &WorkItem,
        reason: String,
        now: DateTime<Utc>,
    ) -> Settlement {
        self.bump(|s| s.failed += 1);
        let attempts = item.attempts + 1;
        if !self.config.backoff.should_retry(attempts) {
            return self.dead_letter_settlement(reason);
        }

        let delay = self.config.backoff.delay_for_attempt(attempts);
        let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        warn!(
            item_id = %item.id,
            queue = %item.queue,
            attempts,
            max_attempts = self.config.backoff.max_attempts,
            retry_at = %retry_at,
            error = %reason,
            "handler failed, retrying"
        );
        Settlement::RecordFailure {
            error: reason,
            retry_at,
        }
    }

    fn dead_letter_settlement(&self, reason: String) -> Settlement {
        self.bump(|s| s.dead_lettered += 1);
        Settlement::DeadLetter(reason)
    }

    async fn settle(&self, item: &WorkItem, settlement: Settlement) {
        let id = item.id;
        let owner = self.config.name.as_str();
        for attempt in 1..=SETTLE_ATTEMPTS {
            let result = match &settlement {
                Settlement::Complete => self.store.complete(id, owner).await,
                Settlement::Release => self.store.release(id, owner).await,
                Settlement::Reschedule(at) => self.store.reschedule(id, owner, *at).await,
                Settlement::RecordFailure { error, retry_at } => {
                    self.store.record_failure(id, owner, error, *retry_at).await
                }
                Settlement::DeadLetter(reason) => {
                    self.store.dead_letter(id, owner, reason).await
                }
            };

            match result {
                Ok(true) => {
                    if let Settlement::DeadLetter(reason) = &settlement {
                        self.sink.dead_lettered(item, reason).await;
                    }
                    return;
                }
                Ok(false) => {
                    self.bump(|s| s.lost_claims += 1);
                    warn!(
                        dispatcher = %owner,
                        item_id = %id,
                        op = settlement.name(),
                        "claim no longer held, settle dropped"
                    );
                    return;
                }
                Err(e) => {
                    self.bump(|s| s.storage_errors += 1);
                    warn!(
                        item_id = %id,
                        op = settlement.name(),
                        attempt,
                        error = %e,
                        "settle failed"
                    );
                    if !e.is_transient() {
                        break;
                    }
                }
            }
        }
        error!(
            item_id = %id,
            op = settlement.name(),
            "giving up on settle, leaving item to lease expiry"
        );
    }

    fn bump(&self, f: impl FnOnce(&mut DispatcherStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Doubling sleep after consecutive claim failures.
fn next_storage_backoff(previous: Option<Duration>, base: Duration, max: Duration) -> Duration {
    match previous {
        Some(prev) => prev.saturating_mul(2).min(max),
        None => base.min(max),
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop polling and wait for the in-flight batch to settle.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "dispatcher task failed");
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
