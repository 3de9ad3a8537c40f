//! Message-bus collaborator traits

use std::sync::Arc;

use async_trait::async_trait;

use super::events::{ExceptionBinding, TaskExceptionMessage};

/// Bus subscription errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    /// Binding the queue to the exchange failed
    #[error("bind failed: {0}")]
    Bind(String),

    /// Connection or channel failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Subscription already closed
    #[error("subscription closed")]
    Closed,
}

/// Message bus that can subscribe to task exceptions
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Bind a new subscription; delivery starts on the first `resume`
    async fn subscribe(
        &self,
        binding: &ExceptionBinding,
    ) -> Result<Arc<dyn Subscription>, SubscriptionError>;
}

/// A bound subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Next delivery: a message or a transport error; `None` once closed
    async fn recv(&self) -> Option<Result<TaskExceptionMessage, SubscriptionError>>;

    /// Stop delivering messages until `resume`
    async fn pause(&self) -> Result<(), SubscriptionError>;

    async fn resume(&self) -> Result<(), SubscriptionError>;

    async fn close(&self) -> Result<(), SubscriptionError>;
}
