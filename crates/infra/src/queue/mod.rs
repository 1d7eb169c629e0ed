//! Durable deferred-work queue.
//!
//! Work items are scheduled for a future effective time, claimed under a
//! lease by one of possibly many dispatchers, and handed to the handler
//! registered for their queue. Delivery is at-least-once: a lease that
//! expires while a handler runs makes the item claimable again, so every
//! handler must be idempotent.
//!
//! ## Components
//!
//! - **WorkItemStore**: persistence and the atomic claim
//! - **HandlerRegistry**: queue name to handler table
//! - **Dispatcher**: polling loop, bounded handler pool, backoff and dead-lettering

pub mod dispatcher;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod types;

pub use dispatcher::{
    DeadLetterSink, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats,
    LoggingDeadLetterSink,
};
pub use postgres::PostgresWorkItemStore;
pub use registry::{
    handler_fn, HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry, WorkItemHandler,
};
pub use store::{InMemoryWorkItemStore, WorkItemStore, CANCELLATION_QUEUE};
pub use types::{
    BackoffPolicy, BackoffStrategy, NewWorkItem, OwnerKey, QueueName, QueueStats, WorkItem,
    WorkItemId, WorkItemStatus,
};
