//! Core work item types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use duebill_core::AccountId;

/// Unique work item identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a queue; routes items to their handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Partition key of a work item (usually the account it concerns).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into an account id, when the key was built from one.
    pub fn account_id(&self) -> Option<AccountId> {
        self.0.parse().ok()
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<AccountId> for OwnerKey {
    fn from(value: AccountId) -> Self {
        Self(value.to_string())
    }
}

/// Processing state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting for its effective time or currently claimed
    Available,
    /// Handled successfully (or dropped as poison)
    Processed,
    /// Withdrawn before it ran
    Cancelled,
    /// Exhausted its attempts or failed permanently
    DeadLettered,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkItemStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Available => "available",
            WorkItemStatus::Processed => "processed",
            WorkItemStatus::Cancelled => "cancelled",
            WorkItemStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(WorkItemStatus::Available),
            "processed" => Some(WorkItemStatus::Processed),
            "cancelled" => Some(WorkItemStatus::Cancelled),
            "dead_lettered" => Some(WorkItemStatus::DeadLettered),
            _ => None,
        }
    }
}

/// Backoff strategy for handler retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
        }
    }

    /// Case-insensitive parse of the names `as_str` produces.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Some(BackoffStrategy::Fixed),
            "exponential" => Some(BackoffStrategy::Exponential),
            "linear" => Some(BackoffStrategy::Linear),
            _ => None,
        }
    }
}

/// Handler retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Handler invocations allowed before the item is dead-lettered
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Check if another invocation is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Request to schedule new work.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkItem {
    pub queue: QueueName,
    pub owner_key: OwnerKey,
    /// Not dispatched before this instant; past values mean "as soon as possible"
    pub effective_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl NewWorkItem {
    pub fn new(
        queue: impl Into<QueueName>,
        owner_key: impl Into<OwnerKey>,
        effective_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            owner_key: owner_key.into(),
            effective_at,
            payload,
        }
    }
}

/// A durable, schedulable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub queue: QueueName,
    pub owner_key: OwnerKey,
    pub effective_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Dispatcher currently holding the lease
    pub claim_owner: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Failed handler invocations so far
    pub attempts: u32,
    pub status: WorkItemStatus,
    pub last_error: Option<String>,
}

impl WorkItem {
    pub fn from_new(id: WorkItemId, new: NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue: new.queue,
            owner_key: new.owner_key,
            effective_at: new.effective_at,
            payload: new.payload,
            created_at: now,
            updated_at: now,
            claim_owner: None,
            claim_expires_at: None,
            attempts: 0,
            status: WorkItemStatus::Available,
            last_error: None,
        }
    }

    /// Whether a lease is active at `now`.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.is_some_and(|exp| exp >= now)
    }

    /// Due, unleased and not terminal.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkItemStatus::Available
            && self.effective_at <= now
            && !self.is_claimed(now)
    }

    pub fn clear_claim(&mut self) {
        self.claim_owner = None;
        self.claim_expires_at = None;
    }

    /// Decode the payload into a typed structure.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub available: usize,
    pub claimed: usize,
    pub processed: usize,
    pub cancelled: usize,
    pub dead_lettered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy =
            BackoffPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy {
            strategy: BackoffStrategy::Linear,
            ..BackoffPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn eligibility_follows_time_claim_and_status() {
        let now = Utc::now();
        let mut item = WorkItem::from_new(
            WorkItemId::new(),
            NewWorkItem::new("q", OwnerKey::new("acct"), now, serde_json::json!({})),
            now,
        );
        assert!(item.is_eligible(now));
        assert!(!item.is_eligible(now - chrono::Duration::seconds(1)));

        item.claim_owner = Some("d1".into());
        item.claim_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!item.is_eligible(now));
        assert!(item.is_eligible(now + chrono::Duration::seconds(31)));

        item.clear_claim();
        item.status = WorkItemStatus::Processed;
        assert!(!item.is_eligible(now));
    }

    #[test]
    fn owner_key_round_trips_account_ids() {
        let account = AccountId::new();
        assert_eq!(OwnerKey::from(account).account_id(), Some(account));
        assert_eq!(OwnerKey::new("batch").account_id(), None);
    }
}
