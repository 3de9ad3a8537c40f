//! Task listener: admission control, poll loop and shutdown drain
//!
//! The listener periodically computes free capacity, applies disk-space
//! back-pressure, claims up to that many runs and hands each claim to its own
//! lifecycle task. A cancellation subscriber and the shutdown coordinator
//! reach into the same [`RunningTasks`] registry concurrently.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dockhand_listener::prelude::*;
//!
//! let listener = TaskListener::new(
//!     ListenerConfig::from_env(),
//!     Collaborators::new(queue_factory, queue_service, diskspace, bus, handlers)
//!         .with_devices(devices)
//!         .with_shutdown(shutdown.clone()),
//! );
//! listener.connect().await?;
//!
//! // ... later, when the host is terminating
//! shutdown.terminate();
//! shutdown.wait_drained().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelListener, ExceptionBinding, MessageBus};
use crate::capacity::{CapacityEvent, DiskspaceCheck};
use crate::config::ListenerConfig;
use crate::devices::DeviceRegistry;
use crate::error::{ListenerError, Result};
use crate::handler::TaskHandlerFactory;
use crate::lifecycle::TaskRunner;
use crate::queue::{QueueService, TaskQueue, TaskQueueFactory};
use crate::registry::RunningTasks;
use crate::shutdown::{ShutdownManager, WORKER_SHUTDOWN};

/// External collaborators injected into the listener
pub struct Collaborators {
    pub queue: TaskQueueFactory,
    pub queue_service: Arc<dyn QueueService>,
    pub diskspace: Arc<dyn DiskspaceCheck>,
    pub bus: Arc<dyn MessageBus>,
    pub handlers: Arc<dyn TaskHandlerFactory>,
    pub devices: DeviceRegistry,
    pub shutdown: Option<Arc<ShutdownManager>>,
}

impl Collaborators {
    pub fn new(
        queue: TaskQueueFactory,
        queue_service: Arc<dyn QueueService>,
        diskspace: Arc<dyn DiskspaceCheck>,
        bus: Arc<dyn MessageBus>,
        handlers: Arc<dyn TaskHandlerFactory>,
    ) -> Self {
        Self {
            queue,
            queue_service,
            diskspace,
            bus,
            handlers,
            devices: DeviceRegistry::default(),
            shutdown: None,
        }
    }

    /// Set the device pools tasks acquire from
    pub fn with_devices(mut self, devices: DeviceRegistry) -> Self {
        self.devices = devices;
        self
    }

    /// Set the termination signal source
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

/// Worker-side task listener
pub struct TaskListener {
    config: ListenerConfig,
    queue_factory: TaskQueueFactory,
    diskspace: Arc<dyn DiskspaceCheck>,
    bus: Arc<dyn MessageBus>,
    shutdown: Option<Arc<ShutdownManager>>,
    running: Arc<RunningTasks>,
    runner: Arc<TaskRunner>,
    queue: RwLock<Option<Arc<dyn TaskQueue>>>,
    cancel_listener: Mutex<Option<Arc<CancelListener>>>,
    poll_stop: Mutex<Option<CancellationToken>>,
    poll_lock: tokio::sync::Mutex<()>,
    draining: CancellationToken,
    watching_shutdown: AtomicBool,
}

impl TaskListener {
    pub fn new(config: ListenerConfig, collaborators: Collaborators) -> Arc<Self> {
        let running = Arc::new(RunningTasks::new(config.capacity));
        let runner = Arc::new(TaskRunner::new(
            config.clone(),
            collaborators.queue_service,
            collaborators.handlers,
            collaborators.devices,
            Arc::clone(&running),
        ));

        Arc::new(Self {
            config,
            queue_factory: collaborators.queue,
            diskspace: collaborators.diskspace,
            bus: collaborators.bus,
            shutdown: collaborators.shutdown,
            running,
            runner,
            queue: RwLock::new(None),
            cancel_listener: Mutex::new(None),
            poll_stop: Mutex::new(None),
            poll_lock: tokio::sync::Mutex::new(()),
            draining: CancellationToken::new(),
            watching_shutdown: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Registry of in-flight runs
    pub fn running(&self) -> &Arc<RunningTasks> {
        &self.running
    }

    /// Wire shutdown, build a fresh queue client, subscribe to cancellations
    /// and start polling
    ///
    /// Connecting again replaces the queue client and the cancellation
    /// subscriber; the previous subscriber is closed first.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.draining.is_cancelled() {
            return Err(ListenerError::ShuttingDown);
        }

        info!(
            worker_id = %self.config.identity.worker_id,
            capacity = self.config.capacity,
            "Begin consuming tasks"
        );

        self.listen_for_shutdowns();
        *self.queue.write() = Some((self.queue_factory)());

        let binding = ExceptionBinding::from(&self.config.identity);
        let cancel_listener =
            CancelListener::connect(self.bus.as_ref(), &binding, Arc::clone(&self.running))
                .await?;
        let previous = self.cancel_listener.lock().replace(cancel_listener);
        if let Some(previous) = previous {
            if !previous.is_dropped() {
                if let Err(e) = previous.close().await {
                    warn!(error = %e, "Failed to close previous cancellation listener");
                }
            }
        }

        self.schedule_poll(self.config.first_poll_delay);
        Ok(())
    }

    /// Watch for node termination; the watcher outlives `close`
    fn listen_for_shutdowns(self: &Arc<Self>) {
        let Some(shutdown) = self.shutdown.clone() else {
            return;
        };
        if self.watching_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener = Arc::clone(self);

        tokio::spawn(async move {
            shutdown.terminated().await;

            info!("Node termination, draining running tasks");
            listener.drain_for_shutdown().await;
            shutdown.mark_drained();
        });
    }

    /// Pause intake and abort every running task, waiting until none is pending
    ///
    /// An admission cycle in progress stops without dispatching. Runs
    /// dispatched but not yet registered end on their own once they see the
    /// closed registry, and the drain waits for them too. Returns the number
    /// of runs aborted.
    pub async fn drain_for_shutdown(&self) -> usize {
        self.draining.cancel();
        self.pause().await;

        let _cycle = self.poll_lock.lock().await;
        let aborted = self.running.abort_all(WORKER_SHUTDOWN).await;
        self.running.wait_idle().await;

        info!(aborted, "Running tasks drained");
        aborted
    }

    /// Start the poll loop, replacing any running one
    ///
    /// The first cycle runs after `first_delay`, later cycles after the
    /// configured poll interval. A failing cycle is logged and the loop
    /// carries on.
    pub fn schedule_poll(self: &Arc<Self>, first_delay: Duration) {
        let stop = CancellationToken::new();
        if let Some(previous) = self.poll_stop.lock().replace(stop.clone()) {
            previous.cancel();
        }

        let listener = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                if let Err(e) = listener.get_tasks().await {
                    error!(
                        alert_operator = true,
                        error = %e,
                        "Task retrieval error"
                    );
                }

                delay = listener.config.poll_interval;
            }
            debug!("Poll loop stopped");
        });
    }

    fn stop_polling(&self) {
        if let Some(stop) = self.poll_stop.lock().take() {
            stop.cancel();
        }
    }

    /// Run one admission cycle, returning the number of claims dispatched
    ///
    /// Cycles are serialized, and every dispatched claim is counted as pending
    /// before the cycle returns, so pending never exceeds capacity.
    pub async fn get_tasks(self: &Arc<Self>) -> Result<usize> {
        let _cycle = self.poll_lock.lock().await;

        if self.draining.is_cancelled() || self.running.is_closed() {
            return Ok(0);
        }

        let available = self.running.available();
        if available == 0 {
            return Ok(0);
        }

        let exceeds = self
            .diskspace
            .exceeds_threshold(
                &self.config.docker_volume,
                self.config.diskspace_threshold,
                available,
            )
            .await?;
        if exceeds {
            debug!(available, "Diskspace threshold exceeded, not claiming");
            return Ok(0);
        }

        let queue = self
            .queue
            .read()
            .clone()
            .ok_or(ListenerError::NotConnected)?;

        let mut claims = tokio::select! {
            biased;
            _ = self.draining.cancelled() => {
                info!("Shutdown began while claiming, claim abandoned");
                return Ok(0);
            }
            claims = queue.claim_work(available) => claims?,
        };
        if self.draining.is_cancelled() || self.running.is_closed() {
            warn!(
                claimed = claims.len(),
                "Shutdown began while claiming, not dispatching claims"
            );
            return Ok(0);
        }

        if claims.len() > available {
            warn!(
                requested = available,
                received = claims.len(),
                "Queue returned more claims than requested, dropping the excess"
            );
            claims.truncate(available);
        }

        let dispatched = claims.len();
        for claim in claims {
            self.running.increment_pending();
            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                runner.run(claim).await;
            });
        }

        if dispatched > 0 {
            debug!(dispatched, pending = self.running.pending(), "Dispatched claims");
        }
        Ok(dispatched)
    }

    fn active_cancel_listener(&self) -> Option<Arc<CancelListener>> {
        let mut slot = self.cancel_listener.lock();
        if slot.as_ref().is_some_and(|l| l.is_dropped()) {
            slot.take();
        }
        slot.clone()
    }

    /// Halt the flow of incoming tasks and cancellations
    pub async fn pause(&self) {
        self.stop_polling();
        if let Some(cancel_listener) = self.active_cancel_listener() {
            if let Err(e) = cancel_listener.pause().await {
                warn!(error = %e, "Failed to pause cancellation listener");
            }
        }
    }

    /// Resume the flow of incoming tasks and cancellations
    pub async fn resume(self: &Arc<Self>) {
        self.schedule_poll(self.config.poll_interval);
        if let Some(cancel_listener) = self.active_cancel_listener() {
            if let Err(e) = cancel_listener.resume().await {
                warn!(error = %e, "Failed to resume cancellation listener");
            }
        }
    }

    /// Stop polling and tear down the cancellation subscriber
    ///
    /// Running tasks are left to finish on their own. Node termination still
    /// aborts and drains them.
    pub async fn close(&self) -> Result<()> {
        self.stop_polling();

        let cancel_listener = self.cancel_listener.lock().take();
        if let Some(cancel_listener) = cancel_listener {
            if !cancel_listener.is_dropped() {
                cancel_listener.close().await?;
            }
        }

        info!("Task listener closed");
        Ok(())
    }

    /// Whether a cancellation subscriber is currently attached
    pub fn is_listening_for_cancellations(&self) -> bool {
        self.active_cancel_listener().is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_idle()
    }

    pub fn pending(&self) -> usize {
        self.running.pending()
    }

    pub fn capacity(&self) -> usize {
        self.running.capacity()
    }

    /// Receive `Working` and `Idle` transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityEvent> {
        self.running.subscribe()
    }
}
