use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::queue::{HandlerContext, HandlerError, HandlerOutcome, WorkItem, WorkItemHandler};

use super::engine::{OverdueEngine, OverdueError};

/// Handler of `overdue.refresh` items.
///
/// An account that stays in a state with a re-evaluation interval keeps
/// being re-checked: when nothing else is pending for it, the item that just
/// ran is moved to the next check instead of being completed.
#[derive(Debug, Clone)]
pub struct OverdueRefreshHandler {
    engine: Arc<OverdueEngine>,
}

impl OverdueRefreshHandler {
    pub fn new(engine: Arc<OverdueEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl WorkItemHandler for OverdueRefreshHandler {
    async fn handle(
        &self,
        item: &WorkItem,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        if ctx.owner_cancelled {
            debug!(
                item_id = %item.id,
                owner_key = %item.owner_key,
                "account closed, skipping refresh"
            );
            return Ok(HandlerOutcome::Done);
        }
        let account_id = item.owner_key.account_id().ok_or_else(|| {
            HandlerError::permanent(format!("owner key '{}' is not an account id", item.owner_key))
        })?;

        let refreshed = self
            .engine
            .refresh_detailed(account_id, ctx.now)
            .await
            .map_err(|e: OverdueError| HandlerError::transient(e.to_string()))?;
        if refreshed.transitioned {
            return Ok(HandlerOutcome::Done);
        }

        let interval = self.engine.state_sets().current().and_then(|set| {
            set.state(&refreshed.state.state_name)
                .and_then(|def| def.reevaluation_interval)
        });
        let Some(next) = interval.and_then(|i| i.after(ctx.now)) else {
            return Ok(HandlerOutcome::Done);
        };

        let others_pending = self
            .engine
            .pending_refreshes(&item.owner_key)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?
            .iter()
            .any(|pending| pending.id != item.id);
        if others_pending {
            Ok(HandlerOutcome::Done)
        } else {
            Ok(HandlerOutcome::RescheduleAt(next))
        }
    }
}
