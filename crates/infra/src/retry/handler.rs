use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use duebill_core::{AccountId, PaymentFailure, PaymentId};
use duebill_payments::{AttemptOutcome, RetryAttempt};

use crate::collaborators::{AttemptResult, PaymentAttemptExecutor, PaymentRequest};
use crate::error::StoreError;
use crate::overdue::{OverdueEngine, OverdueRefreshPayload, OVERDUE_REFRESH_QUEUE};
use crate::queue::{
    HandlerContext, HandlerError, HandlerOutcome, NewWorkItem, OwnerKey, WorkItem, WorkItemHandler,
    WorkItemStore,
};

use super::controller::{PaymentRetryPayload, RetryController, RetryError};

/// Handler of `payment.retry` items.
pub struct PaymentRetryHandler {
    controller: Arc<RetryController>,
    executor: Arc<dyn PaymentAttemptExecutor>,
    overdue: Arc<OverdueEngine>,
    work: Arc<dyn WorkItemStore>,
}

impl PaymentRetryHandler {
    pub fn new(
        controller: Arc<RetryController>,
        executor: Arc<dyn PaymentAttemptExecutor>,
        overdue: Arc<OverdueEngine>,
        work: Arc<dyn WorkItemStore>,
    ) -> Self {
        Self {
            controller,
            executor,
            overdue,
            work,
        }
    }

    async fn initial_failure(
        &self,
        payment_id: PaymentId,
        account_id: AccountId,
        amount: u64,
        failure: PaymentFailure,
        failed_at: DateTime<Utc>,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let candidate =
            RetryAttempt::initial_failure(payment_id, account_id, amount, failure, failed_at);
        let attempt = match self.controller.attempts().insert(&candidate).await {
            Ok(()) => candidate,
            Err(StoreError::Conflict(_)) => self
                .controller
                .attempts()
                .get(payment_id, 1)
                .await
                .map_err(transient)?
                .ok_or_else(|| {
                    HandlerError::transient(format!("attempt 1 of payment {payment_id} vanished"))
                })?,
            Err(e) => return Err(transient(e)),
        };

        if attempt.is_terminal() {
            return Ok(HandlerOutcome::Done);
        }
        if let Some(reason) = self.restriction(account_id, ctx).await? {
            self.controller.abort(&attempt, reason, ctx.now).await.map_err(retry_error)?;
            return Ok(HandlerOutcome::Done);
        }

        self.controller
            .resume_failed(&attempt)
            .await
            .map_err(retry_error)?;
        Ok(HandlerOutcome::Done)
    }

    async fn scheduled_retry(
        &self,
        payment_id: PaymentId,
        attempt_number: u32,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let Some(mut attempt) = self
            .controller
            .attempts()
            .get(payment_id, attempt_number)
            .await
            .map_err(transient)?
        else {
            return Err(HandlerError::permanent(format!(
                "attempt {attempt_number} of payment {payment_id} does not exist"
            )));
        };

        match attempt.outcome {
            AttemptOutcome::Pending => {}
            AttemptOutcome::Failed => {
                // An earlier delivery recorded the failure but may not have
                // scheduled the next attempt.
                let directive = self
                    .controller
                    .resume_failed(&attempt)
                    .await
                    .map_err(retry_error)?;
                debug!(
                    payment_id = %payment_id,
                    attempt_number,
                    directive = ?directive,
                    "resumed failed attempt"
                );
                return Ok(HandlerOutcome::Done);
            }
            AttemptOutcome::Aborted | AttemptOutcome::Success => {
                debug!(
                    payment_id = %payment_id,
                    attempt_number,
                    outcome = attempt.outcome.as_str(),
                    "attempt already settled"
                );
                return Ok(HandlerOutcome::Done);
            }
        }
        if let Some(reason) = self.restriction(attempt.account_id, ctx).await? {
            self.controller.abort(&attempt, reason, ctx.now).await.map_err(retry_error)?;
            return Ok(HandlerOutcome::Done);
        }

        let request = PaymentRequest {
            payment_id,
            account_id: attempt.account_id,
            attempt_number,
            amount: attempt.effective_amount(),
        };
        let result = self
            .executor
            .attempt(&request)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;

        match result {
            AttemptResult::Succeeded => {
                self.controller
                    .record_success(&attempt, ctx.now)
                    .await
                    .map_err(retry_error)?;
                self.schedule_overdue_refresh(attempt.account_id, ctx.now).await;
            }
            AttemptResult::Failed(failure) => {
                attempt.failure = Some(failure);
                let directive = self
                    .controller
                    .handle_failure(&attempt, ctx.now)
                    .await
                    .map_err(retry_error)?;
                info!(
                    payment_id = %payment_id,
                    attempt_number,
                    failure = %failure,
                    directive = ?directive,
                    "payment retry failed"
                );
            }
        }
        Ok(HandlerOutcome::Done)
    }

    /// Reason the account must not be charged right now, if any.
    async fn restriction(
        &self,
        account_id: AccountId,
        ctx: &HandlerContext,
    ) -> Result<Option<&'static str>, HandlerError> {
        if ctx.owner_cancelled {
            return Ok(Some("account closed"));
        }
        let status = self
            .overdue
            .status(account_id)
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))?;
        if status.blocked.disable_auto_pay {
            return Ok(Some("auto-pay disabled by overdue state"));
        }
        Ok(None)
    }

    /// Balances changed; let the overdue engine catch up right away.
    async fn schedule_overdue_refresh(&self, account_id: AccountId, now: DateTime<Utc>) {
        let item = NewWorkItem::new(
            OVERDUE_REFRESH_QUEUE,
            OwnerKey::from(account_id),
            now,
            serde_json::to_value(OverdueRefreshPayload::new("payment succeeded"))
                .unwrap_or_default(),
        );
        if let Err(e) = self.work.enqueue(item).await {
            warn!(
                account_id = %account_id,
                error = %e,
                "could not schedule overdue refresh after payment"
            );
        }
    }
}

#[async_trait]
impl WorkItemHandler for PaymentRetryHandler {
    async fn handle(
        &self,
        item: &WorkItem,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let payload: PaymentRetryPayload = item
            .payload_as()
            .map_err(|e| HandlerError::permanent(format!("malformed payment retry payload: {e}")))?;

        match payload {
            PaymentRetryPayload::InitialFailure {
                payment_id,
                account_id,
                amount,
                failure,
                failed_at,
            } => {
                self.initial_failure(payment_id, account_id, amount, failure, failed_at, ctx)
                    .await
            }
            PaymentRetryPayload::ScheduledRetry {
                payment_id,
                attempt_number,
                ..
            } => self.scheduled_retry(payment_id, attempt_number, ctx).await,
        }
    }
}

impl std::fmt::Debug for PaymentRetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentRetryHandler")
            .field("controller", &self.controller)
            .finish()
    }
}

fn transient(e: StoreError) -> HandlerError {
    HandlerError::transient(e.to_string())
}

fn retry_error(e: RetryError) -> HandlerError {
    match e {
        RetryError::Store(e) => transient(e),
        RetryError::AttemptNotFound { .. } => HandlerError::permanent(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Duration;
    use duebill_overdue::AccountFacts;
    use duebill_payments::FixedScheduleRetryPolicy;

    use crate::collaborators::{AccountFactsSource, CollaboratorError, LoggingEntitlementGate};
    use crate::overdue::{InMemoryOverdueStateStore, StateSetHandle};
    use crate::queue::{InMemoryWorkItemStore, QueueName};
    use crate::retry::{InMemoryRetryAttemptStore, RetryAttemptStore, PAYMENT_RETRY_QUEUE};

    /// Attempt store whose insert of one attempt number fails once.
    struct FlakyAttempts {
        inner: InMemoryRetryAttemptStore,
        fail_insert_of: AtomicU32,
    }

    impl FlakyAttempts {
        fn failing_insert_of(attempt_number: u32) -> Self {
            Self {
                inner: InMemoryRetryAttemptStore::new(),
                fail_insert_of: AtomicU32::new(attempt_number),
            }
        }
    }

    #[async_trait]
    impl RetryAttemptStore for FlakyAttempts {
        async fn insert(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
            if self
                .fail_insert_of
                .compare_exchange(attempt.attempt_number, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.insert(attempt).await
        }

        async fn update(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
            self.inner.update(attempt).await
        }

        async fn get(
            &self,
            payment_id: PaymentId,
            attempt_number: u32,
        ) -> Result<Option<RetryAttempt>, StoreError> {
            self.inner.get(payment_id, attempt_number).await
        }

        async fn list_for_payment(
            &self,
            payment_id: PaymentId,
        ) -> Result<Vec<RetryAttempt>, StoreError> {
            self.inner.list_for_payment(payment_id).await
        }
    }

    struct NoFacts;

    #[async_trait]
    impl AccountFactsSource for NoFacts {
        async fn get(&self, account_id: AccountId) -> Result<AccountFacts, CollaboratorError> {
            Err(CollaboratorError::UnknownAccount(account_id))
        }
    }

    #[derive(Default)]
    struct Declining(AtomicU32);

    #[async_trait]
    impl PaymentAttemptExecutor for Declining {
        async fn attempt(
            &self,
            _request: &PaymentRequest,
        ) -> Result<AttemptResult, CollaboratorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(AttemptResult::Failed(PaymentFailure::Declined))
        }
    }

    #[tokio::test]
    async fn redelivery_after_failed_scheduling_creates_the_next_attempt() {
        let attempts = Arc::new(FlakyAttempts::failing_insert_of(3));
        let work = InMemoryWorkItemStore::arc();
        let executor = Arc::new(Declining::default());
        let engine = Arc::new(OverdueEngine::new(
            Arc::new(InMemoryOverdueStateStore::new()),
            work.clone(),
            Arc::new(NoFacts),
            Arc::new(LoggingEntitlementGate),
            Arc::new(StateSetHandle::new()),
        ));
        let controller = Arc::new(RetryController::new(
            attempts.clone(),
            work.clone(),
            Arc::new(FixedScheduleRetryPolicy::default()),
        ));
        let handler = PaymentRetryHandler::new(controller, executor.clone(), engine, work.clone());

        let t = Utc::now();
        let first = RetryAttempt::initial_failure(
            PaymentId::new(),
            AccountId::new(),
            10_000,
            PaymentFailure::Declined,
            t,
        );
        let second = first.next(t + Duration::days(8), None, t);
        attempts.inner.insert(&first).await.unwrap();
        attempts.inner.insert(&second).await.unwrap();
        let payload = PaymentRetryPayload::ScheduledRetry {
            payment_id: second.payment_id,
            account_id: second.account_id,
            attempt_number: 2,
            amount: 10_000,
        };
        let id = work
            .enqueue(NewWorkItem::new(
                PAYMENT_RETRY_QUEUE,
                OwnerKey::from(second.account_id),
                second.scheduled_for,
                serde_json::to_value(&payload).unwrap(),
            ))
            .await
            .unwrap();
        let item = work.get(id).await.unwrap().unwrap();
        let charged_at = second.scheduled_for;

        let first_delivery = handler.handle(&item, &HandlerContext::at(charged_at)).await;
        assert!(matches!(first_delivery, Err(HandlerError::Transient(_))));

        let redelivery = handler
            .handle(&item, &HandlerContext::at(charged_at + Duration::minutes(5)))
            .await
            .unwrap();
        assert_eq!(redelivery, HandlerOutcome::Done);

        // The declined charge is not repeated
        assert_eq!(executor.0.load(Ordering::SeqCst), 1);

        let rows = attempts.list_for_payment(first.payment_id).await.unwrap();
        let outcomes: Vec<_> = rows.iter().map(|a| (a.attempt_number, a.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (1, AttemptOutcome::Failed),
                (2, AttemptOutcome::Failed),
                (3, AttemptOutcome::Pending)
            ]
        );
        assert_eq!(rows[2].scheduled_for, charged_at + Duration::days(8));

        let third_items = work
            .all(&QueueName::new(PAYMENT_RETRY_QUEUE))
            .into_iter()
            .filter_map(|item| item.payload_as::<PaymentRetryPayload>().ok())
            .filter(|p| matches!(p, PaymentRetryPayload::ScheduledRetry { attempt_number: 3, .. }))
            .count();
        assert_eq!(third_items, 1);
    }
}
