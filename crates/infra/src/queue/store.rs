//! Work item storage: the trait and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

use super::types::{
    NewWorkItem, OwnerKey, QueueName, QueueStats, WorkItem, WorkItemId, WorkItemStatus,
};

/// Queue holding cancellation markers. Never polled by a dispatcher.
pub const CANCELLATION_QUEUE: &str = "_cancel";

/// Durable table of scheduled work items. Pure persistence, no policy.
///
/// Implementations must make `claim_due` a single atomic conditional update:
/// concurrent callers never receive the same item while its lease is active.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Persist a new item. Fails only when the store is unavailable.
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError>;

    /// Lease up to `batch_size` eligible items of `queue` to `claim_owner`
    /// until `now + lease`, oldest effective time first.
    async fn claim_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
        claim_owner: &str,
    ) -> Result<Vec<WorkItem>, StoreError>;

    // Settle writes apply only while `claim_owner` still holds the claim.
    // They return `Ok(false)` when the claim has passed to someone else or
    // the item is already terminal, and `NotFound` when `id` is unknown.

    /// Mark processed.
    async fn complete(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError>;

    /// Drop the lease early; the item is immediately re-eligible.
    async fn release(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError>;

    /// Move the effective time and drop the lease.
    async fn reschedule(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        effective_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Count a failed invocation, keep the error and reschedule, in one write.
    async fn record_failure(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Count a failed invocation and make the item terminal.
    async fn dead_letter(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Withdraw a non-terminal item. Returns whether anything changed.
    async fn cancel(&self, id: WorkItemId) -> Result<bool, StoreError>;

    /// Withdraw unleased items of `owner` on `queue` that are due after `now`.
    async fn cancel_pending(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Non-terminal items of `owner` on `queue`, by effective time.
    async fn pending_for_owner(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
    ) -> Result<Vec<WorkItem>, StoreError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    async fn list_dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    async fn stats(&self, queue: &QueueName, now: DateTime<Utc>) -> Result<QueueStats, StoreError>;

    /// Record that deferred work for `owner` must no longer act.
    async fn mark_owner_cancelled(
        &self,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn is_owner_cancelled(&self, owner: &OwnerKey) -> Result<bool, StoreError>;
}

/// In-memory work item store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWorkItemStore {
    items: Mutex<HashMap<WorkItemId, WorkItem>>,
}

impl InMemoryWorkItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every item of `queue` (any status), oldest first.
    pub fn all(&self, queue: &QueueName) -> Vec<WorkItem> {
        let items = match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut result: Vec<_> = items.values().filter(|i| &i.queue == queue).cloned().collect();
        result.sort_by_key(|i| (i.effective_at, i.created_at));
        result
    }

    fn update<R>(
        &self,
        id: WorkItemId,
        f: impl FnOnce(&mut WorkItem) -> R,
    ) -> Result<R, StoreError> {
        let mut items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let item = items
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("work item {id}")))?;
        let result = f(item);
        item.updated_at = Utc::now();
        Ok(result)
    }

    /// Apply `f` only while `claim_owner` holds the claim on a live item.
    fn settle(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        f: impl FnOnce(&mut WorkItem),
    ) -> Result<bool, StoreError> {
        self.update(id, |item| {
            if item.status.is_terminal() || item.claim_owner.as_deref() != Some(claim_owner) {
                return false;
            }
            f(item);
            item.clear_claim();
            true
        })
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        let mut items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let id = WorkItemId::new();
        items.insert(id, WorkItem::from_new(id, item, Utc::now()));
        Ok(id)
    }

    async fn claim_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
        claim_owner: &str,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();

        // Selection and claim happen under one lock: the in-memory analogue
        // of a single conditional UPDATE.
        let mut items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let mut candidates: Vec<_> = items
            .values()
            .filter(|i| &i.queue == queue && i.is_eligible(now))
            .map(|i| (i.effective_at, i.created_at, i.id))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(item) = items.get_mut(&id) {
                item.claim_owner = Some(claim_owner.to_string());
                item.claim_expires_at = Some(expires_at);
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError> {
        self.settle(id, claim_owner, |item| item.status = WorkItemStatus::Processed)
    }

    async fn release(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError> {
        self.settle(id, claim_owner, |_| {})
    }

    async fn reschedule(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        effective_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.settle(id, claim_owner, |item| item.effective_at = effective_at)
    }

    async fn record_failure(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.settle(id, claim_owner, |item| {
            item.attempts += 1;
            item.last_error = Some(error.to_string());
            item.effective_at = retry_at;
        })
    }

    async fn dead_letter(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        self.settle(id, claim_owner, |item| {
            item.attempts += 1;
            item.status = WorkItemStatus::DeadLettered;
            item.last_error = Some(reason.to_string());
        })
    }

    async fn cancel(&self, id: WorkItemId) -> Result<bool, StoreError> {
        self.update(id, |item| {
            if item.status.is_terminal() {
                return false;
            }
            item.status = WorkItemStatus::Cancelled;
            item.clear_claim();
            true
        })
    }

    async fn cancel_pending(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let mut cancelled = 0;
        for item in items.values_mut() {
            if &item.queue == queue
                && &item.owner_key == owner
                && item.status == WorkItemStatus::Available
                && item.effective_at > now
                && !item.is_claimed(now)
            {
                item.status = WorkItemStatus::Cancelled;
                item.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn pending_for_owner(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<_> = items
            .values()
            .filter(|i| &i.queue == queue && &i.owner_key == owner && !i.status.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|i| (i.effective_at, i.created_at));
        Ok(result)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        Ok(items.get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<_> = items
            .values()
            .filter(|i| &i.queue == queue && i.status == WorkItemStatus::DeadLettered)
            .cloned()
            .collect();
        result.sort_by_key(|i| i.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, queue: &QueueName, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        let items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let mut stats = QueueStats::default();
        for item in items.values().filter(|i| &i.queue == queue) {
            match item.status {
                WorkItemStatus::Available if item.is_claimed(now) => stats.claimed += 1,
                WorkItemStatus::Available => stats.available += 1,
                WorkItemStatus::Processed => stats.processed += 1,
                WorkItemStatus::Cancelled => stats.cancelled += 1,
                WorkItemStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }

    async fn mark_owner_cancelled(
        &self,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        let id = WorkItemId::new();
        let mut marker = WorkItem::from_new(
            id,
            NewWorkItem::new(CANCELLATION_QUEUE, owner.clone(), now, serde_json::Value::Null),
            now,
        );
        marker.status = WorkItemStatus::Processed;
        items.insert(id, marker);
        Ok(())
    }

    async fn is_owner_cancelled(&self, owner: &OwnerKey) -> Result<bool, StoreError> {
        let items = self.items.lock().map_err(|_| StoreError::poisoned())?;
        Ok(items
            .values()
            .any(|i| i.queue.as_str() == CANCELLATION_QUEUE && &i.owner_key == owner))
    }
}

#[async_trait]
impl<S> WorkItemStore for Arc<S>
where
    S: WorkItemStore + ?Sized,
{
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, StoreError> {
        (**self).enqueue(item).await
    }

    async fn claim_due(
        &self,
        queue: &QueueName,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
        claim_owner: &str,
    ) -> Result<Vec<WorkItem>, StoreError> {
        (**self).claim_due(queue, now, lease, batch_size, claim_owner).await
    }

    async fn complete(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError> {
        (**self).complete(id, claim_owner).await
    }

    async fn release(&self, id: WorkItemId, claim_owner: &str) -> Result<bool, StoreError> {
        (**self).release(id, claim_owner).await
    }

    async fn reschedule(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        effective_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).reschedule(id, claim_owner, effective_at).await
    }

    async fn record_failure(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).record_failure(id, claim_owner, error, retry_at).await
    }

    async fn dead_letter(
        &self,
        id: WorkItemId,
        claim_owner: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        (**self).dead_letter(id, claim_owner, reason).await
    }

    async fn cancel(&self, id: WorkItemId) -> Result<bool, StoreError> {
        (**self).cancel(id).await
    }

    async fn cancel_pending(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).cancel_pending(queue, owner, now).await
    }

    async fn pending_for_owner(
        &self,
        queue: &QueueName,
        owner: &OwnerKey,
    ) -> Result<Vec<WorkItem>, StoreError> {
        (**self).pending_for_owner(queue, owner).await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        (**self).get(id).await
    }

    async fn list_dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        (**self).list_dead_letters(queue, limit).await
    }

    async fn stats(&self, queue: &QueueName, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        (**self).stats(queue, now).await
    }

    async fn mark_owner_cancelled(
        &self,
        owner: &OwnerKey,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).mark_owner_cancelled(owner, now).await
    }

    async fn is_owner_cancelled(&self, owner: &OwnerKey) -> Result<bool, StoreError> {
        (**self).is_owner_cancelled(owner).await
    }
}
