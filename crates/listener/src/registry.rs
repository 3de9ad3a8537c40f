//! Running-task registry with exactly-once cleanup
//!
//! Every path that ends a registered run (normal finish, cancellation,
//! shutdown) goes through [`RunningTasks`]. Whoever removes a state from the
//! map owns its cleanup: releasing its devices and decrementing the pending
//! count. Removal happens under the map lock, so each state is cleaned by
//! exactly one path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::cancel::CancellationEvent;
use crate::capacity::{CapacityEvent, PendingCounter};
use crate::devices::{release_all, DeviceLeases};
use crate::handler::TaskHandler;
use crate::queue::Claim;

/// Identifies one run of one task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub task_id: String,
    pub run_id: u32,
}

impl RunKey {
    pub fn new(task_id: impl Into<String>, run_id: u32) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
        }
    }
}

impl From<&Claim> for RunKey {
    fn from(claim: &Claim) -> Self {
        Self::new(claim.task_id(), claim.run_id)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.run_id)
    }
}

/// A registered run: its handler and the devices it holds
pub struct RunningTaskState {
    key: RunKey,
    handler: Arc<dyn TaskHandler>,
    devices: DeviceLeases,
    cleaned: AtomicBool,
}

impl RunningTaskState {
    pub fn new(key: RunKey, handler: Arc<dyn TaskHandler>, devices: DeviceLeases) -> Self {
        Self {
            key,
            handler,
            devices,
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    pub fn devices(&self) -> &DeviceLeases {
        &self.devices
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Release every held device; only the first call has any effect
    ///
    /// Returns the number of devices returned to their pools.
    pub fn cleanup(&self) -> usize {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return 0;
        }
        release_all(&self.devices)
    }
}

impl fmt::Debug for RunningTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTaskState")
            .field("key", &self.key)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("cleaned", &self.is_cleaned())
            .finish()
    }
}

/// Registry of in-flight runs and the pending count that gates admission
pub struct RunningTasks {
    tasks: Mutex<HashMap<RunKey, Arc<RunningTaskState>>>,
    counter: PendingCounter,
    closed: AtomicBool,
}

impl RunningTasks {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            counter: PendingCounter::new(capacity),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.counter.capacity()
    }

    /// Count a claimed run that has not reached a terminal state
    pub fn increment_pending(&self) -> usize {
        self.counter.increment()
    }

    pub fn decrement_pending(&self) -> usize {
        self.counter.decrement()
    }

    pub fn pending(&self) -> usize {
        self.counter.pending()
    }

    pub fn available(&self) -> usize {
        self.counter.available()
    }

    pub fn is_idle(&self) -> bool {
        self.counter.is_idle()
    }

    /// Wait until no claimed run is pending
    pub async fn wait_idle(&self) {
        let mut events = self.counter.subscribe();
        while !self.counter.is_idle() {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Receive working/idle transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityEvent> {
        self.counter.subscribe()
    }

    /// Release the devices of a state, tolerating states already cleaned
    pub fn cleanup_running_state(&self, state: Option<&RunningTaskState>) -> usize {
        match state {
            Some(state) => {
                let released = state.cleanup();
                debug!(
                    task_id = %state.key.task_id,
                    run_id = state.key.run_id,
                    released,
                    "Cleaned up running state"
                );
                released
            }
            None => 0,
        }
    }

    /// Register a run; returns false once the registry has been closed
    pub fn insert(&self, state: Arc<RunningTaskState>) -> bool {
        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        tasks.insert(state.key.clone(), state);
        true
    }

    pub fn get(&self, key: &RunKey) -> Option<Arc<RunningTaskState>> {
        self.tasks.lock().get(key).cloned()
    }

    /// Remove a run without cleaning it up
    pub fn remove(&self, key: &RunKey) -> Option<Arc<RunningTaskState>> {
        self.tasks.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Keys of every registered run
    pub fn keys(&self) -> Vec<RunKey> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Whether shutdown has closed the registry
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// End a run that reached a terminal state on its own
    ///
    /// Returns false when another path already removed the run.
    pub fn finish(&self, key: &RunKey) -> bool {
        let Some(state) = self.remove(key) else {
            return false;
        };
        self.cleanup_running_state(Some(&state));
        self.decrement_pending();
        true
    }

    /// Stop a run the queue canceled
    ///
    /// Returns false when no such run is registered on this worker.
    pub async fn cancel(&self, event: &CancellationEvent) -> bool {
        let key = event.key();
        let Some(state) = self.remove(&key) else {
            debug!(
                task_id = %key.task_id,
                run_id = key.run_id,
                "Cancellation for a run not held by this worker, ignoring"
            );
            return false;
        };

        let reason = event.reason_resolved.as_deref().unwrap_or_default();
        info!(
            task_id = %key.task_id,
            run_id = key.run_id,
            reason,
            "Canceling task"
        );

        state.handler.cancel(reason).await;
        self.cleanup_running_state(Some(&state));
        self.decrement_pending();
        true
    }

    /// Close the registry and abort every registered run concurrently
    ///
    /// Runs registered after this call are rejected by [`insert`](Self::insert).
    /// Returns the number of runs aborted.
    pub async fn abort_all(&self, reason: &str) -> usize {
        let drained: Vec<Arc<RunningTaskState>> = {
            let mut tasks = self.tasks.lock();
            self.closed.store(true, Ordering::Release);
            tasks.drain().map(|(_, state)| state).collect()
        };

        let count = drained.len();
        join_all(drained.into_iter().map(|state| async move {
            info!(
                task_id = %state.key.task_id,
                run_id = state.key.run_id,
                reason,
                "Aborting task"
            );
            state.handler.abort(reason).await;
            self.cleanup_running_state(Some(&state));
            self.decrement_pending();
        }))
        .await;

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::TaskExceptionMessage;
    use crate::devices::{loopback_video, DeviceRegistry, LOOPBACK_VIDEO};
    use crate::handler::TaskError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        fn task_id(&self) -> &str {
            "abc"
        }

        fn run_id(&self) -> u32 {
            0
        }

        async fn start(&self) -> Result<(), TaskError> {
            Ok(())
        }

        async fn cancel(&self, reason: &str) {
            self.calls.lock().push(format!("cancel:{}", reason));
        }

        async fn abort(&self, reason: &str) {
            self.calls.lock().push(format!("abort:{}", reason));
        }
    }

    fn setup() -> (RunningTasks, DeviceRegistry, Arc<RecordingHandler>) {
        let running = RunningTasks::new(2);
        let devices = DeviceRegistry::new().with_pool(LOOPBACK_VIDEO, loopback_video(1));
        (running, devices, Arc::new(RecordingHandler::default()))
    }

    fn register(
        running: &RunningTasks,
        devices: &DeviceRegistry,
        handler: Arc<RecordingHandler>,
        key: RunKey,
    ) {
        let leases = devices.acquire_for_task([LOOPBACK_VIDEO], false).unwrap();
        running.increment_pending();
        assert!(running.insert(Arc::new(RunningTaskState::new(key, handler, leases))));
    }

    #[test]
    fn test_state_cleanup_runs_once() {
        let (_, devices, handler) = setup();
        let leases = devices.acquire_for_task([LOOPBACK_VIDEO], false).unwrap();
        let state = RunningTaskState::new(RunKey::new("abc", 0), handler, leases);

        assert_eq!(state.cleanup(), 1);
        assert_eq!(state.cleanup(), 0);
        assert!(state.is_cleaned());
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[test]
    fn test_finish_releases_and_decrements() {
        let (running, devices, handler) = setup();
        let key = RunKey::new("abc", 0);
        register(&running, &devices, handler, key.clone());

        assert!(running.finish(&key));
        assert!(!running.finish(&key));
        assert_eq!(running.pending(), 0);
        assert!(running.is_empty());
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_finish_cleans_once() {
        let (running, devices, handler) = setup();
        let key = RunKey::new("abc", 0);
        register(&running, &devices, Arc::clone(&handler), key.clone());

        let message = TaskExceptionMessage::resolved("abc", 0, "canceled");
        let event = CancellationEvent::from_message(&message).unwrap();

        assert!(running.cancel(&event).await);
        assert!(!running.finish(&key));
        assert_eq!(running.pending(), 0);
        assert_eq!(*handler.calls.lock(), vec!["cancel:canceled".to_string()]);
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_noop() {
        let (running, _, _) = setup();
        let message = TaskExceptionMessage::resolved("missing", 0, "canceled");
        let event = CancellationEvent::from_message(&message).unwrap();

        assert!(!running.cancel(&event).await);
        assert_eq!(running.pending(), 0);
    }

    #[tokio::test]
    async fn test_abort_all_closes_registry() {
        let (running, devices, handler) = setup();
        register(&running, &devices, Arc::clone(&handler), RunKey::new("abc", 0));

        assert_eq!(running.abort_all("worker-shutdown").await, 1);
        assert!(running.is_closed());
        assert!(running.is_idle());
        assert_eq!(*handler.calls.lock(), vec!["abort:worker-shutdown".to_string()]);

        let state = RunningTaskState::new(RunKey::new("late", 0), handler, DeviceLeases::new());
        assert!(!running.insert(Arc::new(state)));
    }

    #[tokio::test]
    async fn test_wait_idle_follows_last_decrement() {
        let running = Arc::new(RunningTasks::new(2));
        running.wait_idle().await;

        running.increment_pending();
        running.increment_pending();
        let waiter = tokio::spawn({
            let running = Arc::clone(&running);
            async move { running.wait_idle().await }
        });

        running.decrement_pending();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        running.decrement_pending();
        waiter.await.unwrap();
        assert!(running.is_idle());
    }

    #[test]
    fn test_run_key_display() {
        let claim = Claim::new("abc", 3);
        assert_eq!(RunKey::from(&claim).to_string(), "abc/3");
    }
}
