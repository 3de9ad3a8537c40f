//! Per-task lifecycle
//!
//! Each claimed run walks `Claimed → Fetching → DeviceAcquisition → Running`
//! and ends in `Completed`, `Failed` or `Cancelled`. The pending count is
//! incremented by the poll cycle before the lifecycle starts; the lifecycle
//! guarantees exactly one matching decrement:
//!
//! - before registration (fetch or device failure, shutdown in progress) the
//!   lifecycle releases what it holds and decrements directly
//! - after registration, whichever path removes the run from
//!   [`RunningTasks`] (completion here, cancellation, shutdown) does it

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::config::ListenerConfig;
use crate::devices::DeviceRegistry;
use crate::error::{ListenerError, Result};
use crate::handler::{LaunchOptions, TaskHandlerFactory};
use crate::queue::{Claim, QueueService};
use crate::registry::{RunKey, RunningTaskState, RunningTasks};
use crate::telemetry::TIME_TO_REACH_WORKER;

/// Lifecycle phase of one claimed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Claimed,
    Fetching,
    DeviceAcquisition,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Claimed => "claimed",
            Self::Fetching => "fetching",
            Self::DeviceAcquisition => "device_acquisition",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

struct Progress {
    phase: TaskPhase,
    registered: bool,
}

/// Drives claimed runs through their lifecycle
pub struct TaskRunner {
    config: ListenerConfig,
    queue_service: Arc<dyn QueueService>,
    handlers: Arc<dyn TaskHandlerFactory>,
    devices: DeviceRegistry,
    running: Arc<RunningTasks>,
}

impl TaskRunner {
    pub fn new(
        config: ListenerConfig,
        queue_service: Arc<dyn QueueService>,
        handlers: Arc<dyn TaskHandlerFactory>,
        devices: DeviceRegistry,
        running: Arc<RunningTasks>,
    ) -> Self {
        Self {
            config,
            queue_service,
            handlers,
            devices,
            running,
        }
    }

    /// Run one claim to a terminal phase
    ///
    /// The caller must already have counted the claim as pending.
    pub async fn run(&self, claim: Claim) -> TaskPhase {
        let key = RunKey::from(&claim);
        info!(task_id = %key.task_id, run_id = key.run_id, "Run task");

        let mut progress = Progress {
            phase: TaskPhase::Claimed,
            registered: false,
        };

        match self.execute(claim, &mut progress).await {
            Ok(()) => {
                if self.running.finish(&key) {
                    info!(task_id = %key.task_id, run_id = key.run_id, "Task completed");
                    TaskPhase::Completed
                } else {
                    debug!(
                        task_id = %key.task_id,
                        run_id = key.run_id,
                        "Task resolved after it was stopped"
                    );
                    TaskPhase::Cancelled
                }
            }
            Err(e) => {
                if progress.registered {
                    if !self.running.finish(&key) {
                        debug!(
                            task_id = %key.task_id,
                            run_id = key.run_id,
                            error = %e,
                            "Task ended after it was stopped"
                        );
                        return TaskPhase::Cancelled;
                    }
                } else {
                    self.running.decrement_pending();
                }

                error!(
                    task_id = %key.task_id,
                    run_id = key.run_id,
                    phase = %progress.phase,
                    error = %e,
                    "Task error"
                );
                TaskPhase::Failed
            }
        }
    }

    async fn execute(&self, claim: Claim, progress: &mut Progress) -> Result<()> {
        let key = RunKey::from(&claim);

        progress.phase = TaskPhase::Fetching;
        let definition = self.queue_service.task(&key.task_id).await?;

        if claim.is_first_run() {
            let elapsed = Utc::now().signed_duration_since(definition.created);
            info!(
                stat = TIME_TO_REACH_WORKER,
                task_id = %key.task_id,
                millis = elapsed.num_milliseconds(),
                "Time from task creation to worker"
            );
        }

        progress.phase = TaskPhase::DeviceAcquisition;
        let leases = self.devices.acquire_for_task(
            definition.requested_devices(),
            self.config.isolated_containers,
        )?;
        if !leases.is_empty() {
            debug!(
                task_id = %key.task_id,
                run_id = key.run_id,
                devices = ?leases.keys().collect::<Vec<_>>(),
                "Acquired devices"
            );
        }

        progress.phase = TaskPhase::Running;
        let options = LaunchOptions::from_leases(&leases);
        let handler = self
            .handlers
            .build(&self.config, definition, claim, options);

        let state = Arc::new(RunningTaskState::new(
            key.clone(),
            Arc::clone(&handler),
            leases,
        ));
        if !self.running.insert(Arc::clone(&state)) {
            state.cleanup();
            return Err(ListenerError::ShuttingDown);
        }
        progress.registered = true;

        handler.start().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{loopback_video, LOOPBACK_VIDEO};
    use crate::handler::{TaskError, TaskHandler};
    use crate::queue::{InMemoryQueue, TaskDefinition};
    use async_trait::async_trait;

    struct ImmediateHandler {
        task_id: String,
        run_id: u32,
        fail: bool,
    }

    #[async_trait]
    impl TaskHandler for ImmediateHandler {
        fn task_id(&self) -> &str {
            &self.task_id
        }

        fn run_id(&self) -> u32 {
            self.run_id
        }

        async fn start(&self) -> std::result::Result<(), TaskError> {
            if self.fail {
                return Err(anyhow::anyhow!("container exited with 1").into());
            }
            Ok(())
        }

        async fn cancel(&self, _reason: &str) {}

        async fn abort(&self, _reason: &str) {}
    }

    struct ImmediateFactory {
        fail: bool,
    }

    impl TaskHandlerFactory for ImmediateFactory {
        fn build(
            &self,
            _runtime: &ListenerConfig,
            _definition: TaskDefinition,
            claim: Claim,
            _options: LaunchOptions,
        ) -> Arc<dyn TaskHandler> {
            Arc::new(ImmediateHandler {
                task_id: claim.task_id().to_string(),
                run_id: claim.run_id,
                fail: self.fail,
            })
        }
    }

    fn runner(queue: Arc<InMemoryQueue>, fail: bool) -> (TaskRunner, DeviceRegistry) {
        let devices = DeviceRegistry::new().with_pool(LOOPBACK_VIDEO, loopback_video(1));
        let runner = TaskRunner::new(
            ListenerConfig::new(2),
            queue,
            Arc::new(ImmediateFactory { fail }),
            devices.clone(),
            Arc::new(RunningTasks::new(2)),
        );
        (runner, devices)
    }

    #[tokio::test]
    async fn test_completed_run_releases_devices() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.put_definition("abc", TaskDefinition::new().with_device(LOOPBACK_VIDEO));
        let (runner, devices) = runner(queue, false);

        runner.running.increment_pending();
        assert_eq!(runner.run(Claim::new("abc", 0)).await, TaskPhase::Completed);

        assert!(runner.running.is_idle());
        assert!(runner.running.is_empty());
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_releases_devices() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.put_definition("abc", TaskDefinition::new().with_device(LOOPBACK_VIDEO));
        let (runner, devices) = runner(queue, true);

        runner.running.increment_pending();
        assert_eq!(runner.run(Claim::new("abc", 1)).await, TaskPhase::Failed);

        assert!(runner.running.is_idle());
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_decrements_once() {
        let queue = Arc::new(InMemoryQueue::new());
        let (runner, _) = runner(queue, false);

        runner.running.increment_pending();
        assert_eq!(runner.run(Claim::new("missing", 0)).await, TaskPhase::Failed);
        assert_eq!(runner.running.pending(), 0);
    }

    #[tokio::test]
    async fn test_unrecognized_device_fails_without_leaking() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.put_definition(
            "abc",
            TaskDefinition::new()
                .with_device(LOOPBACK_VIDEO)
                .with_device("tpu"),
        );
        let (runner, devices) = runner(queue, false);

        runner.running.increment_pending();
        assert_eq!(runner.run(Claim::new("abc", 0)).await, TaskPhase::Failed);

        assert!(runner.running.is_idle());
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[tokio::test]
    async fn test_closed_registry_rejects_run() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.put_definition("abc", TaskDefinition::new().with_device(LOOPBACK_VIDEO));
        let (runner, devices) = runner(queue, false);

        runner.running.abort_all("worker-shutdown").await;
        runner.running.increment_pending();
        assert_eq!(runner.run(Claim::new("abc", 0)).await, TaskPhase::Failed);

        assert!(runner.running.is_idle());
        assert_eq!(devices.pool(LOOPBACK_VIDEO).unwrap().available(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(TaskPhase::DeviceAcquisition.to_string(), "device_acquisition");
        assert!(TaskPhase::Cancelled.is_terminal());
        assert!(!TaskPhase::Running.is_terminal());
    }
}
