//! Listener configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity this worker claims work and receives cancellations under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub provisioner_id: String,
}

impl Default for WorkerIdentity {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            worker_type: "docker-worker".to_string(),
            worker_group: "default".to_string(),
            provisioner_id: "local".to_string(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Worker identity
    pub identity: WorkerIdentity,

    /// Maximum concurrent tasks
    pub capacity: usize,

    /// Delay between poll cycles
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Delay before the first poll after connecting
    #[serde(with = "duration_millis")]
    pub first_poll_delay: Duration,

    /// Volume whose free space gates claiming
    pub docker_volume: PathBuf,

    /// Free bytes required per claimable task
    pub diskspace_threshold: u64,

    /// Pin every task to its own CPU set
    pub isolated_containers: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            identity: WorkerIdentity::default(),
            capacity: 5,
            poll_interval: Duration::from_secs(5),
            first_poll_delay: Duration::from_millis(1),
            docker_volume: PathBuf::from("/mnt"),
            diskspace_threshold: 10_000_000_000,
            isolated_containers: false,
        }
    }
}

impl ListenerConfig {
    /// Create a configuration with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self::default().with_capacity(capacity)
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`, `WORKER_TYPE`, `WORKER_GROUP`, `PROVISIONER_ID`
    /// - `CAPACITY`: Maximum concurrent tasks (default: 5)
    /// - `TASK_POLL_INTERVAL_MS`: Poll interval in milliseconds (default: 5000)
    /// - `DOCKER_VOLUME`: Volume checked for free space (default: /mnt)
    /// - `DISKSPACE_THRESHOLD_BYTES`: Free bytes required per task
    /// - `ISOLATED_CONTAINERS`: "true" or "1" to pin tasks to CPU sets
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let identity = WorkerIdentity {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.identity.worker_id),
            worker_type: std::env::var("WORKER_TYPE").unwrap_or(defaults.identity.worker_type),
            worker_group: std::env::var("WORKER_GROUP").unwrap_or(defaults.identity.worker_group),
            provisioner_id: std::env::var("PROVISIONER_ID")
                .unwrap_or(defaults.identity.provisioner_id),
        };

        Self {
            identity,
            capacity: env_parse("CAPACITY").unwrap_or(defaults.capacity).max(1),
            poll_interval: env_parse("TASK_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            first_poll_delay: defaults.first_poll_delay,
            docker_volume: std::env::var("DOCKER_VOLUME")
                .map(PathBuf::from)
                .unwrap_or(defaults.docker_volume),
            diskspace_threshold: env_parse("DISKSPACE_THRESHOLD_BYTES")
                .unwrap_or(defaults.diskspace_threshold),
            isolated_containers: std::env::var("ISOLATED_CONTAINERS")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1"))
                .unwrap_or(defaults.isolated_containers),
        }
    }

    /// Set the worker identity
    pub fn with_identity(mut self, identity: WorkerIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Set maximum concurrency
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delay before the first poll
    pub fn with_first_poll_delay(mut self, delay: Duration) -> Self {
        self.first_poll_delay = delay;
        self
    }

    /// Set the volume checked for free space
    pub fn with_docker_volume(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_volume = path.into();
        self
    }

    /// Set the free bytes required per task
    pub fn with_diskspace_threshold(mut self, bytes: u64) -> Self {
        self.diskspace_threshold = bytes;
        self
    }

    /// Enable or disable CPU-set isolation
    pub fn with_isolated_containers(mut self, isolated: bool) -> Self {
        self.isolated_containers = isolated;
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
