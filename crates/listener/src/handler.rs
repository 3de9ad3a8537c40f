//! Task handler seam
//!
//! A task handler owns the actual execution of one claimed run (container
//! lifecycle, artifact upload, reporting). The listener only builds it,
//! awaits [`TaskHandler::start`], and asks it to stop through `cancel` or
//! `abort`, which may be called concurrently with a pending `start`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ListenerConfig;
use crate::devices::{Device, DeviceLeases, CPU};
use crate::queue::{Claim, TaskDefinition};

/// Task execution errors
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Run was canceled through the queue
    #[error("task canceled: {0}")]
    Canceled(String),

    /// Run was aborted by the worker
    #[error("task aborted: {0}")]
    Aborted(String),

    /// Execution failed
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Device and cpuset options the handler launches the task with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOptions {
    /// CPU set the container is pinned to (isolated-container mode)
    pub cpuset: Option<String>,

    /// Leased devices by capability name
    pub devices: BTreeMap<String, Device>,
}

impl LaunchOptions {
    /// Options describing a task's acquired leases
    pub fn from_leases(leases: &DeviceLeases) -> Self {
        let mut options = Self::default();
        for (name, lease) in leases {
            if name == CPU {
                options.cpuset = Some(lease.id().to_string());
            } else {
                options.devices.insert(name.clone(), lease.device().clone());
            }
        }
        options
    }
}

/// Executes one claimed run
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_id(&self) -> &str;

    fn run_id(&self) -> u32;

    /// Run the task to completion
    async fn start(&self) -> Result<(), TaskError>;

    /// Stop because the queue resolved the run (e.g. `canceled`)
    async fn cancel(&self, reason: &str);

    /// Stop because the worker is giving the run up (e.g. `worker-shutdown`)
    async fn abort(&self, reason: &str);
}

/// Builds a handler for each claim
pub trait TaskHandlerFactory: Send + Sync {
    fn build(
        &self,
        runtime: &ListenerConfig,
        definition: TaskDefinition,
        claim: Claim,
        options: LaunchOptions,
    ) -> Arc<dyn TaskHandler>;
}
