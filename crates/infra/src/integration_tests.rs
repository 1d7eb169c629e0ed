//! End-to-end tests of the wired service against in-memory stores.
//!
//! Events go in through the ingress, the dispatcher is polled by hand at
//! chosen instants, and the collaborators record what they were asked to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use duebill_core::{AccountId, InvoiceId, PaymentFailure, PaymentId};
use duebill_events::BillingEvent;
use duebill_overdue::{AccountFacts, BlockFlags, CLEAR_STATE};
use duebill_payments::{
    AttemptOutcome, PaymentRetryPolicy, RetryContext, RetryDecision, RetryPolicyRegistry,
};

use crate::collaborators::{
    AccountFactsSource, AttemptResult, CollaboratorError, EntitlementGate, InvoiceGenerator,
    PaymentAttemptExecutor, PaymentRequest,
};
use crate::config::CoreConfig;
use crate::overdue::OVERDUE_REFRESH_QUEUE;
use crate::queue::{OwnerKey, QueueName};
use crate::retry::{PaymentRetryPayload, PAYMENT_RETRY_QUEUE};
use crate::service::{BillingCoreService, CoreDependencies};

const OVERDUE_CONFIG: &str = r#"{
    "states": [
        {"name": "OD1", "condition": {"days_overdue_at_least": 30},
         "actions": {"block_changes": true, "disable_auto_pay": true}}
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
struct Gate(Mutex<Vec<(AccountId, BlockFlags)>>);

impl Gate {
    fn calls(&self) -> Vec<(AccountId, BlockFlags)> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntitlementGate for Gate {
    async fn set_blocked(
        &self,
        account_id: AccountId,
        flags: BlockFlags,
    ) -> Result<(), CollaboratorError> {
        self.0.lock().unwrap().push((account_id, flags));
        Ok(())
    }
}

#[derive(Default)]
struct Executor {
    requests: Mutex<Vec<PaymentRequest>>,
}

#[async_trait]
impl PaymentAttemptExecutor for Executor {
    async fn attempt(&self, request: &PaymentRequest) -> Result<AttemptResult, CollaboratorError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(AttemptResult::Succeeded)
    }
}

#[derive(Default)]
struct Invoices(Mutex<Vec<(AccountId, DateTime<Utc>)>>);

#[async_trait]
impl InvoiceGenerator for Invoices {
    async fn generate(
        &self,
        account_id: AccountId,
        target_date: DateTime<Utc>,
    ) -> Result<Vec<InvoiceId>, CollaboratorError> {
        self.0.lock().unwrap().push((account_id, target_date));
        Ok(vec![InvoiceId::new()])
    }
}

/// Retries once a day for 90% of the previous attempt.
struct NinetyPercentDaily;

impl PaymentRetryPolicy for NinetyPercentDaily {
    fn name(&self) -> &str {
        "ninety-percent-daily"
    }

    fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        RetryDecision::RetryAt {
            at: ctx.failed_at + Duration::hours(24),
            adjusted_amount: Some(ctx.attempted_amount * 9 / 10),
        }
    }
}

struct Harness {
    service: BillingCoreService,
    facts: Arc<Facts>,
    gate: Arc<Gate>,
    executor: Arc<Executor>,
    invoices: Arc<Invoices>,
}

fn harness(config: CoreConfig) -> Harness {
    let facts = Arc::new(Facts::default());
    let gate = Arc::new(Gate::default());
    let executor = Arc::new(Executor::default());
    let invoices = Arc::new(Invoices::default());

    let mut policies = RetryPolicyRegistry::with_defaults();
    policies.register(Arc::new(NinetyPercentDaily));
    let deps = CoreDependencies::in_memory(
        facts.clone(),
        gate.clone(),
        executor.clone(),
        invoices.clone(),
    )
    .with_policies(policies);

    let service = BillingCoreService::build(deps, &config).unwrap();
    service.reload_state_set(OVERDUE_CONFIG).unwrap();
    Harness {
        service,
        facts,
        gate,
        executor,
        invoices,
    }
}

fn default_harness() -> Harness {
    harness(CoreConfig {
        retry_policy: "ninety-percent-daily".to_string(),
        ..CoreConfig::default()
    })
}

#[tokio::test]
async fn account_goes_overdue_and_recovers_with_one_block_and_one_unblock() {
    let h = default_harness();
    let account = AccountId::new();
    let t = Utc::now();
    h.facts.set(account, AccountFacts::overdue(31, 4_000));

    h.service
        .ingress()
        .publish(BillingEvent::InvoiceDue {
            account_id: account,
            invoice_id: InvoiceId::new(),
            occurred_at: t,
        })
        .await
        .unwrap();
    h.service.dispatcher().poll_at(t).await.unwrap();

    let status = h.service.engine().status(account).await.unwrap();
    assert_eq!(status.state_name, "OD1");
    assert!(status.blocked.block_changes);

    h.facts.set(account, AccountFacts::settled());
    let paid = t + Duration::hours(2);
    h.service
        .ingress()
        .publish(BillingEvent::PaymentSucceeded {
            account_id: account,
            payment_id: PaymentId::new(),
            amount: 4_000,
            occurred_at: paid,
        })
        .await
        .unwrap();
    h.service.dispatcher().poll_at(paid).await.unwrap();
    h.service.dispatcher().poll_at(paid + Duration::days(30)).await.unwrap();

    let status = h.service.engine().status(account).await.unwrap();
    assert_eq!(status.state_name, CLEAR_STATE);

    let calls = h.gate.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].1.block_changes);
    assert_eq!(calls[1].1, BlockFlags::default());
    assert_eq!(h.service.stats().succeeded, 2);
}

#[tokio::test]
async fn failed_payment_schedules_one_discounted_retry_a_day_later() {
    let h = default_harness();
    let account = AccountId::new();
    let payment_id = PaymentId::new();
    let t = Utc::now();
    h.facts.set(account, AccountFacts::settled());

    h.service
        .ingress()
        .publish(BillingEvent::PaymentFailed {
            account_id: account,
            payment_id,
            amount: 10_000,
            failure: PaymentFailure::Declined,
            occurred_at: t,
        })
        .await
        .unwrap();
    h.service.dispatcher().poll_at(t).await.unwrap();

    let attempts = h.service.retries().attempts().list_for_payment(payment_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Pending);

    let pending = h
        .service
        .work()
        .pending_for_owner(&QueueName::new(PAYMENT_RETRY_QUEUE), &OwnerKey::from(account))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].effective_at, t + Duration::hours(24));
    assert!(matches!(
        pending[0].payload_as::<PaymentRetryPayload>().unwrap(),
        PaymentRetryPayload::ScheduledRetry { attempt_number: 2, amount: 9_000, .. }
    ));

    // Not due yet
    h.service.dispatcher().poll_at(t + Duration::hours(23)).await.unwrap();
    assert!(h.executor.requests.lock().unwrap().is_empty());

    h.service.dispatcher().poll_at(t + Duration::hours(24)).await.unwrap();
    let requests = h.executor.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].attempt_number, 2);
    assert_eq!(requests[0].amount, 9_000);

    let attempts = h.service.retries().attempts().list_for_payment(payment_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Success);

    let refreshes = h
        .service
        .work()
        .pending_for_owner(&QueueName::new(OVERDUE_REFRESH_QUEUE), &OwnerKey::from(account))
        .await
        .unwrap();
    assert_eq!(refreshes.len(), 1);
}

#[tokio::test]
async fn overdue_state_that_disables_auto_pay_aborts_the_retry() {
    let h = default_harness();
    let account = AccountId::new();
    let payment_id = PaymentId::new();
    let t = Utc::now();
    h.facts.set(account, AccountFacts::overdue(45, 10_000));
    h.service.engine().refresh(account, t).await.unwrap();

    h.service
        .ingress()
        .publish(BillingEvent::PaymentFailed {
            account_id: account,
            payment_id,
            amount: 10_000,
            failure: PaymentFailure::Declined,
            occurred_at: t,
        })
        .await
        .unwrap();
    h.service.dispatcher().poll_at(t).await.unwrap();

    let attempts = h.service.retries().attempts().list_for_payment(payment_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Aborted);
    assert!(h.executor.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn billing_date_generates_invoices_then_refreshes() {
    let h = default_harness();
    let account = AccountId::new();
    let t = Utc::now();
    let billing_date = t + Duration::days(1);
    h.facts.set(account, AccountFacts::settled());

    h.service
        .ingress()
        .publish(BillingEvent::BillingDateScheduled {
            account_id: account,
            target_date: billing_date,
            occurred_at: t,
        })
        .await
        .unwrap();

    h.service.dispatcher().poll_at(t).await.unwrap();
    assert!(h.invoices.0.lock().unwrap().is_empty());

    h.service.dispatcher().poll_at(billing_date).await.unwrap();
    h.service.dispatcher().poll_at(billing_date).await.unwrap();

    assert_eq!(*h.invoices.0.lock().unwrap(), vec![(account, billing_date)]);
    assert!(h
        .service
        .work()
        .pending_for_owner(&QueueName::new(OVERDUE_REFRESH_QUEUE), &OwnerKey::from(account))
        .await
        .unwrap()
        .is_empty());
    assert!(h.gate.calls().is_empty());
}

#[tokio::test]
async fn closed_account_gets_no_invoices_and_no_retries() {
    let h = default_harness();
    let account = AccountId::new();
    let payment_id = PaymentId::new();
    let t = Utc::now();
    h.facts.set(account, AccountFacts::settled());

    let ingress = h.service.ingress();
    ingress
        .publish(BillingEvent::BillingDateScheduled {
            account_id: account,
            target_date: t + Duration::days(3),
            occurred_at: t,
        })
        .await
        .unwrap();
    ingress
        .publish(BillingEvent::AccountClosed {
            account_id: account,
            occurred_at: t,
        })
        .await
        .unwrap();
    ingress
        .publish(BillingEvent::PaymentFailed {
            account_id: account,
            payment_id,
            amount: 2_500,
            failure: PaymentFailure::Declined,
            occurred_at: t,
        })
        .await
        .unwrap();

    h.service.dispatcher().poll_at(t + Duration::days(5)).await.unwrap();

    assert!(h.invoices.0.lock().unwrap().is_empty());
    let attempts = h.service.retries().attempts().list_for_payment(payment_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Aborted);
}

#[tokio::test]
async fn rejected_reload_keeps_active_configuration() {
    let h = default_harness();
    let version = h.service.engine().state_sets().current().unwrap().version();

    assert!(h.service.reload_state_set(r#"{"states": [{"name": "clear"}]}"#).is_err());
    assert!(h.service.reload_state_set("not json").is_err());
    assert_eq!(h.service.engine().state_sets().current().unwrap().version(), version);

    let next = h.service.reload_state_set(OVERDUE_CONFIG).unwrap();
    assert!(next > version);
}

#[tokio::test]
async fn unknown_retry_policy_fails_start() {
    let deps = CoreDependencies::in_memory(
        Arc::new(Facts::default()),
        Arc::new(Gate::default()),
        Arc::new(Executor::default()),
        Arc::new(Invoices::default()),
    );
    let config = CoreConfig {
        retry_policy: "no-such-policy".to_string(),
        ..CoreConfig::default()
    };
    assert!(matches!(
        BillingCoreService::start(deps, config).await,
        Err(crate::service::ServiceError::UnknownPolicy(name)) if name == "no-such-policy"
    ));
}

#[tokio::test]
async fn running_service_processes_events_until_shutdown() {
    let config = CoreConfig {
        poll_interval: StdDuration::from_millis(10),
        ..CoreConfig::default()
    };
    let facts = Arc::new(Facts::default());
    let gate = Arc::new(Gate::default());
    let deps = CoreDependencies::in_memory(
        facts.clone(),
        gate.clone(),
        Arc::new(Executor::default()),
        Arc::new(Invoices::default()),
    );
    let service = BillingCoreService::start(deps, config).await.unwrap();
    service.reload_state_set(OVERDUE_CONFIG).unwrap();
    assert!(service.is_running());

    let account = AccountId::new();
    facts.set(account, AccountFacts::overdue(40, 1_000));
    service
        .ingress()
        .publish(BillingEvent::InvoiceDue {
            account_id: account,
            invoice_id: InvoiceId::new(),
            occurred_at: Utc::now(),
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
    while gate.calls().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(gate.calls().len(), 1);

    service.shutdown().await;
}
