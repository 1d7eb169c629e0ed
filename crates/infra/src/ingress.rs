//! Event ingress: billing events become explicit enqueue calls.
//!
//! The core does not subscribe to any bus. Whoever produces a
//! [`BillingEvent`] hands it to [`EventIngress::publish`], which schedules
//! the matching work item.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use duebill_events::{BillingEvent, Event};

use crate::billing::{BillingDatePayload, BILLING_DATE_QUEUE};
use crate::error::StoreError;
use crate::overdue::{OverdueRefreshPayload, OVERDUE_REFRESH_QUEUE};
use crate::queue::{NewWorkItem, OwnerKey, QueueName, WorkItemId, WorkItemStore};
use crate::retry::{PaymentRetryPayload, PAYMENT_RETRY_QUEUE};

/// Queues whose future items are withdrawn when an account closes.
const ACCOUNT_QUEUES: [&str; 3] = [OVERDUE_REFRESH_QUEUE, PAYMENT_RETRY_QUEUE, BILLING_DATE_QUEUE];

#[derive(Clone)]
pub struct EventIngress {
    work: Arc<dyn WorkItemStore>,
}

impl EventIngress {
    pub fn new(work: Arc<dyn WorkItemStore>) -> Self {
        Self { work }
    }

    /// Schedule arbitrary work. Past effective times run as soon as possible.
    pub async fn enqueue(
        &self,
        queue: impl Into<QueueName>,
        owner_key: impl Into<OwnerKey>,
        effective_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<WorkItemId, StoreError> {
        self.work
            .enqueue(NewWorkItem::new(queue, owner_key, effective_at, payload))
            .await
    }

    /// Translate `event` into work. Returns the scheduled item, or `None`
    /// for events that only record a cancellation.
    #[instrument(
        skip(self, event),
        fields(event = event.event_type(), account_id = %event.account_id()),
        err
    )]
    pub async fn publish(&self, event: BillingEvent) -> Result<Option<WorkItemId>, StoreError> {
        let owner = OwnerKey::from(event.account_id());

        let (queue, effective_at, payload) = match event {
            BillingEvent::InvoiceCreated { due_at, .. } => (
                OVERDUE_REFRESH_QUEUE,
                due_at,
                to_json(&OverdueRefreshPayload::new("invoice due"))?,
            ),
            BillingEvent::InvoiceDue { occurred_at, .. } => (
                OVERDUE_REFRESH_QUEUE,
                occurred_at,
                to_json(&OverdueRefreshPayload::new("invoice due"))?,
            ),
            BillingEvent::PaymentSucceeded { occurred_at, .. } => (
                OVERDUE_REFRESH_QUEUE,
                occurred_at,
                to_json(&OverdueRefreshPayload::new("payment succeeded"))?,
            ),
            BillingEvent::BillingDateScheduled { target_date, .. } => {
                (BILLING_DATE_QUEUE, target_date, to_json(&BillingDatePayload { target_date })?)
            }
            BillingEvent::PaymentFailed {
                account_id,
                payment_id,
                amount,
                failure,
                occurred_at,
            } => (
                PAYMENT_RETRY_QUEUE,
                occurred_at,
                to_json(&PaymentRetryPayload::InitialFailure {
                    payment_id,
                    account_id,
                    amount,
                    failure,
                    failed_at: occurred_at,
                })?,
            ),
            BillingEvent::AccountClosed { occurred_at, .. } => {
                self.close_account(&owner, occurred_at).await?;
                return Ok(None);
            }
        };

        let id = self
            .work
            .enqueue(NewWorkItem::new(queue, owner, effective_at, payload))
            .await?;
        debug!(item_id = %id, queue, effective_at = %effective_at, "event scheduled");
        Ok(Some(id))
    }

    async fn close_account(&self, owner: &OwnerKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.work.mark_owner_cancelled(owner, at).await?;
        let mut withdrawn = 0;
        for queue in ACCOUNT_QUEUES {
            withdrawn += self.work.cancel_pending(&QueueName::new(queue), owner, at).await?;
        }
        info!(owner_key = %owner, withdrawn, "account closed, deferred work cancelled");
        Ok(())
    }
}

impl std::fmt::Debug for EventIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIngress").finish_non_exhaustive()
    }
}

fn to_json<T: serde::Serialize>(payload: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(payload).map_err(|e| StoreError::Serialization(e.to_string()))
}
