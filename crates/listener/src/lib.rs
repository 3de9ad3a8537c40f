//! # Dockhand Task Listener
//!
//! Worker-side orchestrator that claims tasks from a remote queue and keeps
//! local resources honest while they run.
//!
//! ## Features
//!
//! - **Admission control**: claims at most `capacity - pending` runs per poll,
//!   gated by disk-space back-pressure on the docker volume
//! - **Exclusive devices**: loopback video/audio devices and CPU sets leased
//!   per task from injected pools, acquired all-or-nothing
//! - **Cancellation**: task-exception messages from the bus stop the matching
//!   running task
//! - **Exactly-once cleanup**: devices are released and pending decremented
//!   once per run, whether it completes, fails, is canceled or is aborted by
//!   shutdown
//! - **Working/idle notifications** for external capacity reporting
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  claim_work   ┌──────────────┐
//! │ TaskListener │──────────────▶│  TaskQueue   │
//! │ (poll loop)  │               └──────────────┘
//! └──────┬───────┘
//!        │ spawn per claim
//!        ▼
//! ┌──────────────┐  acquire      ┌────────────────┐
//! │  TaskRunner  │──────────────▶│ DeviceRegistry │
//! │ (lifecycle)  │               └────────────────┘
//! └──────┬───────┘
//!        │ insert / finish
//!        ▼
//! ┌──────────────┐◀── cancel ─── CancelListener (message bus)
//! │ RunningTasks │◀── abort_all ─ ShutdownManager
//! └──────────────┘
//! ```

pub mod cancel;
pub mod capacity;
pub mod config;
pub mod devices;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cancel::{
        CancelListener, CancellationEvent, ExceptionBinding, InMemoryBus, MessageBus,
        Subscription, SubscriptionError, TaskExceptionMessage,
    };
    pub use crate::capacity::{
        CapacityEvent, DiskspaceCheck, DiskspaceError, FixedDiskspace, SysinfoDiskspace,
    };
    pub use crate::config::{ListenerConfig, WorkerIdentity};
    pub use crate::devices::{
        DeviceError, DeviceLease, DevicePool, DeviceRegistry, LOOPBACK_AUDIO, LOOPBACK_VIDEO,
    };
    pub use crate::error::ListenerError;
    pub use crate::handler::{LaunchOptions, TaskError, TaskHandler, TaskHandlerFactory};
    pub use crate::lifecycle::{TaskPhase, TaskRunner};
    pub use crate::listener::{Collaborators, TaskListener};
    pub use crate::queue::{
        Claim, InMemoryQueue, QueueError, QueueService, TaskDefinition, TaskQueue,
        TaskQueueFactory,
    };
    pub use crate::registry::{RunKey, RunningTasks};
    pub use crate::shutdown::{ShutdownManager, WORKER_SHUTDOWN};
}

// Re-export key types at crate root
pub use config::{ListenerConfig, WorkerIdentity};
pub use error::ListenerError;
pub use listener::{Collaborators, TaskListener};
pub use shutdown::ShutdownManager;
