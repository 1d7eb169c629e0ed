//! Billing-date trigger: generate the invoices due at an account's billing
//! date, then let the overdue engine look at the new balance.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collaborators::InvoiceGenerator;
use crate::overdue::{OverdueRefreshPayload, OVERDUE_REFRESH_QUEUE};
use crate::queue::{
    HandlerContext, HandlerError, HandlerOutcome, NewWorkItem, WorkItem, WorkItemHandler,
    WorkItemStore,
};

/// Queue of billing-date triggers.
pub const BILLING_DATE_QUEUE: &str = "invoice.billing-date";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDatePayload {
    pub target_date: DateTime<Utc>,
}

pub struct BillingDateHandler {
    generator: Arc<dyn InvoiceGenerator>,
    work: Arc<dyn WorkItemStore>,
}

impl BillingDateHandler {
    pub fn new(generator: Arc<dyn InvoiceGenerator>, work: Arc<dyn WorkItemStore>) -> Self {
        Self { generator, work }
    }
}

#[async_trait]
impl WorkItemHandler for BillingDateHandler {
    async fn handle(
        &self,
        item: &WorkItem,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        if ctx.owner_cancelled {
            debug!(
                item_id = %item.id,
                owner_key = %item.owner_key,
                "account closed, skipping invoice generation"
            );
            return Ok(HandlerOutcome::Done);
        }
        let payload: BillingDatePayload = item
            .payload_as()
            .map_err(|e| HandlerError::permanent(format!("malformed billing date payload: {e}")))?;
        let account_id = item.owner_key.account_id().ok_or_else(|| {
            HandlerError::permanent(format!("owner key '{}' is not an account id", item.owner_key))
        })?;

        let invoices = self
            .generator
            .generate(account_id, payload.target_date)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        info!(
            account_id = %account_id,
            target_date = %payload.target_date,
            invoices = invoices.len(),
            "invoices generated"
        );

        let refresh = NewWorkItem::new(
            OVERDUE_REFRESH_QUEUE,
            item.owner_key.clone(),
            ctx.now,
            serde_json::to_value(OverdueRefreshPayload::new("invoices generated"))
                .map_err(|e| HandlerError::permanent(e.to_string()))?,
        );
        self.work
            .enqueue(refresh)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        Ok(HandlerOutcome::Done)
    }
}

impl std::fmt::Debug for BillingDateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingDateHandler").finish_non_exhaustive()
    }
}
