//! Named device pools and per-task acquisition

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::pool::{DeviceError, DeviceLease, DevicePool};

/// Capability name for loopback video devices
pub const LOOPBACK_VIDEO: &str = "loopbackVideo";

/// Capability name for loopback audio devices
pub const LOOPBACK_AUDIO: &str = "loopbackAudio";

/// Key the CPU-set lease is stored under in a task's leases
pub const CPU: &str = "cpu";

/// Leases held by one task, keyed by device name
pub type DeviceLeases = BTreeMap<String, DeviceLease>;

/// Registry of device pools shared by every task on this worker
///
/// Pools are injected at construction; cloning the registry shares the same
/// pools.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    pools: HashMap<String, Arc<DevicePool>>,
    cpu: Option<Arc<DevicePool>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under a capability name
    pub fn with_pool(mut self, name: impl Into<String>, pool: Arc<DevicePool>) -> Self {
        self.pools.insert(name.into(), pool);
        self
    }

    /// Register the CPU-set pool used in isolated-container mode
    pub fn with_cpu_pool(mut self, pool: Arc<DevicePool>) -> Self {
        self.cpu = Some(pool);
        self
    }

    /// Pool registered for a capability name
    pub fn pool(&self, name: &str) -> Option<&Arc<DevicePool>> {
        self.pools.get(name)
    }

    pub fn cpu_pool(&self) -> Option<&Arc<DevicePool>> {
        self.cpu.as_ref()
    }

    /// Acquire every lease a task needs, or none of them
    ///
    /// With `isolated` set, a CPU-set lease is taken first. Then one lease per
    /// requested device name. If any step fails, every lease acquired so far
    /// is released before the error is returned.
    pub fn acquire_for_task<'a, I>(
        &self,
        requested: I,
        isolated: bool,
    ) -> Result<DeviceLeases, DeviceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut leases = DeviceLeases::new();

        if let Err(e) = self.acquire_into(&mut leases, requested, isolated) {
            let released = release_all(&leases);
            debug!(released, error = %e, "Rolled back partial device acquisition");
            return Err(e);
        }

        Ok(leases)
    }

    fn acquire_into<'a, I>(
        &self,
        leases: &mut DeviceLeases,
        requested: I,
        isolated: bool,
    ) -> Result<(), DeviceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if isolated {
            let pool = self
                .cpu
                .as_ref()
                .ok_or_else(|| DeviceError::UnrecognizedDevice(CPU.to_string()))?;
            leases.insert(CPU.to_string(), pool.acquire()?);
        }

        for name in requested {
            let pool = self
                .pools
                .get(name)
                .ok_or_else(|| DeviceError::UnrecognizedDevice(name.to_string()))?;
            leases.insert(name.to_string(), pool.acquire()?);
        }

        Ok(())
    }
}

/// Release every lease, returning how many were actually returned to a pool
pub fn release_all(leases: &DeviceLeases) -> usize {
    leases.values().filter(|lease| lease.release()).count()
}
