//! Queue collaborator traits

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{Claim, TaskDefinition};

/// Error type for queue operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The claim request was rejected or failed in transport
    #[error("claim work failed: {0}")]
    Claim(String),

    /// Task definition does not exist
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Any other request failure
    #[error("queue request failed: {0}")]
    Request(String),
}

/// Client that claims work for this worker
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Claim up to `max_claims` runs
    async fn claim_work(&self, max_claims: usize) -> Result<Vec<Claim>, QueueError>;
}

/// Remote queue service used to fetch full task definitions
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn task(&self, task_id: &str) -> Result<TaskDefinition, QueueError>;
}

/// Builds a fresh claim client each time the listener connects
pub type TaskQueueFactory = Arc<dyn Fn() -> Arc<dyn TaskQueue> + Send + Sync>;
