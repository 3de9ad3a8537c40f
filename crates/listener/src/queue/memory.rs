//! In-memory queue for testing
//!
//! Implements both [`TaskQueue`] and [`QueueService`] over seeded tasks, and
//! records every claim request so tests can assert on admission decisions.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::client::{QueueError, QueueService, TaskQueue};
use super::types::{Claim, TaskDefinition};

/// In-memory implementation of the queue collaborators
///
/// # Example
///
/// ```
/// use dockhand_listener::queue::{InMemoryQueue, TaskDefinition};
///
/// let queue = InMemoryQueue::new();
/// queue.add_task("task-1", TaskDefinition::new());
/// assert_eq!(queue.pending_claims(), 1);
/// ```
pub struct InMemoryQueue {
    tasks: RwLock<HashMap<String, TaskDefinition>>,
    claims: Mutex<VecDeque<Claim>>,
    claim_requests: Mutex<Vec<usize>>,
    claim_failure: Mutex<Option<String>>,
    fetch_failures: Mutex<HashSet<String>>,
}

impl InMemoryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            claims: Mutex::new(VecDeque::new()),
            claim_requests: Mutex::new(Vec::new()),
            claim_failure: Mutex::new(None),
            fetch_failures: Mutex::new(HashSet::new()),
        }
    }

    /// Store a task definition and make its first run claimable
    pub fn add_task(&self, task_id: &str, definition: TaskDefinition) {
        self.tasks.write().insert(task_id.to_string(), definition);
        self.claims.lock().push_back(Claim::new(task_id, 0));
    }

    /// Make an arbitrary claim available without storing a definition
    pub fn add_claim(&self, claim: Claim) {
        self.claims.lock().push_back(claim);
    }

    /// Store a task definition without enqueuing a claim
    pub fn put_definition(&self, task_id: &str, definition: TaskDefinition) {
        self.tasks.write().insert(task_id.to_string(), definition);
    }

    /// Make the next `claim_work` call fail
    pub fn fail_next_claim(&self, message: impl Into<String>) {
        *self.claim_failure.lock() = Some(message.into());
    }

    /// Make every fetch of `task_id` fail
    pub fn fail_fetch(&self, task_id: &str) {
        self.fetch_failures.lock().insert(task_id.to_string());
    }

    /// `max_claims` of every claim request received, in order
    pub fn claim_requests(&self) -> Vec<usize> {
        self.claim_requests.lock().clone()
    }

    /// Number of claims not yet handed out
    pub fn pending_claims(&self) -> usize {
        self.claims.lock().len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn claim_work(&self, max_claims: usize) -> Result<Vec<Claim>, QueueError> {
        self.claim_requests.lock().push(max_claims);

        if let Some(message) = self.claim_failure.lock().take() {
            return Err(QueueError::Claim(message));
        }

        let mut claims = self.claims.lock();
        let count = max_claims.min(claims.len());
        Ok(claims.drain(..count).collect())
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    async fn task(&self, task_id: &str) -> Result<TaskDefinition, QueueError> {
        if self.fetch_failures.lock().contains(task_id) {
            return Err(QueueError::Request(format!("fetch of {} failed", task_id)));
        }

        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claims_respect_max() {
        let queue = InMemoryQueue::new();
        for i in 0..3 {
            queue.add_task(&format!("task-{}", i), TaskDefinition::new());
        }

        let claims = queue.claim_work(2).await.unwrap();
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].task_id(), "task-0");
        assert_eq!(queue.pending_claims(), 1);
        assert_eq!(queue.claim_requests(), vec![2]);
    }

    #[tokio::test]
    async fn test_claim_failure_is_one_shot() {
        let queue = InMemoryQueue::new();
        queue.add_task("task-0", TaskDefinition::new());
        queue.fail_next_claim("unavailable");

        assert!(matches!(queue.claim_work(1).await, Err(QueueError::Claim(_))));
        assert_eq!(queue.claim_work(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch() {
        let queue = InMemoryQueue::new();
        queue.add_task("task-0", TaskDefinition::new().with_device("loopbackVideo"));
        queue.put_definition("task-1", TaskDefinition::new());
        queue.fail_fetch("task-1");

        let task = queue.task("task-0").await.unwrap();
        assert_eq!(task.requested_devices().collect::<Vec<_>>(), vec!["loopbackVideo"]);

        assert!(matches!(queue.task("task-1").await, Err(QueueError::Request(_))));
        assert!(matches!(
            queue.task("missing").await,
            Err(QueueError::TaskNotFound(_))
        ));
    }
}
