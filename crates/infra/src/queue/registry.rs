//! Handler registration: queue name to handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{QueueName, WorkItem};

/// What a handler did with an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; mark the item done.
    Done,
    /// Not yet; run again at the given time. Does not count as a failure.
    RescheduleAt(DateTime<Utc>),
    /// Give the item back immediately, e.g. when shutting down mid-batch.
    Release,
}

/// Handler failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// May succeed on a later attempt; counted against the backoff budget.
    #[error("transient handler failure: {0}")]
    Transient(String),
    /// Will never succeed; the item is dead-lettered at once.
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

/// Per-invocation context supplied by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    /// Dispatcher clock at claim time.
    pub now: DateTime<Utc>,
    /// Failed invocations before this one.
    pub attempt: u32,
    /// Whether the item's owner has a cancellation marker.
    pub owner_cancelled: bool,
    /// Identity of the dispatcher holding the lease.
    pub dispatcher: String,
}

impl HandlerContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            attempt: 0,
            owner_cancelled: false,
            dispatcher: "direct".to_string(),
        }
    }
}

/// Processes the items of one queue. Must be idempotent: a lease can expire
/// while the handler is still running and the item may be handled twice.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    async fn handle(
        &self,
        item: &WorkItem,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError>;
}

/// Table of handlers keyed by queue name. One handler per queue.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<QueueName, Arc<dyn WorkItemHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the queue.
    pub fn register(&mut self, queue: impl Into<QueueName>, handler: Arc<dyn WorkItemHandler>) {
        self.handlers.insert(queue.into(), handler);
    }

    pub fn with(mut self, queue: impl Into<QueueName>, handler: Arc<dyn WorkItemHandler>) -> Self {
        self.register(queue, handler);
        self
    }

    pub fn get(&self, queue: &QueueName) -> Option<Arc<dyn WorkItemHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Registered queues in name order.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<_> = self.handlers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("queues", &self.queues())
            .finish()
    }
}

/// Adapter turning an async closure into a handler.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WorkItemHandler>
where
    F: Fn(WorkItem, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> WorkItemHandler for FnHandler<F>
where
    F: Fn(WorkItem, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        item: &WorkItem,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(item.clone(), ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_routes_by_queue_name() {
        let registry = HandlerRegistry::new()
            .with("b", handler_fn(|_, _| async { Ok(HandlerOutcome::Done) }))
            .with("a", handler_fn(|_, _| async { Err(HandlerError::permanent("nope")) }));

        assert_eq!(registry.queues(), vec![QueueName::new("a"), QueueName::new("b")]);
        assert!(registry.get(&QueueName::new("missing")).is_none());

        let now = Utc::now();
        let item = crate::queue::WorkItem::from_new(
            crate::queue::WorkItemId::new(),
            crate::queue::NewWorkItem::new(
                "a",
                crate::queue::OwnerKey::new("x"),
                now,
                serde_json::Value::Null,
            ),
            now,
        );
        let handler = registry.get(&QueueName::new("a")).unwrap();
        assert_eq!(
            handler.handle(&item, &HandlerContext::at(now)).await,
            Err(HandlerError::Permanent("nope".into()))
        );
    }
}
