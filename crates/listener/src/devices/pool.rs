//! Fixed device pools and the leases they hand out
//!
//! A pool owns a fixed list of devices of one kind. `acquire` reserves the
//! first free device and returns a [`DeviceLease`] that remembers the pool it
//! came from; releasing the lease puts the device back into exactly that pool.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Kind of exclusive resource a pool manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// v4l2 loopback video device
    LoopbackVideo,
    /// ALSA loopback sound card
    LoopbackAudio,
    /// A CPU core handed to the container as its cpuset
    CpuSet,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoopbackVideo => write!(f, "loopback_video"),
            Self::LoopbackAudio => write!(f, "loopback_audio"),
            Self::CpuSet => write!(f, "cpu_set"),
        }
    }
}

/// A single device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Identifier unique within the pool (device index or core number)
    pub id: String,

    /// Device kind
    pub kind: DeviceKind,

    /// Host paths that must be mounted into the task container
    pub mount_points: Vec<PathBuf>,
}

/// Device allocation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Every device in the pool is reserved
    #[error("no {kind} device available (pool size {size})")]
    PoolExhausted { kind: DeviceKind, size: usize },

    /// The task asked for a device name no pool is registered for
    #[error("unrecognized device requested: {0}")]
    UnrecognizedDevice(String),
}

struct Slot {
    device: Device,
    reserved: bool,
}

/// Fixed pool of devices of one kind
pub struct DevicePool {
    kind: DeviceKind,
    slots: Mutex<Vec<Slot>>,
}

impl DevicePool {
    /// Create a pool over the given devices
    pub fn new(kind: DeviceKind, devices: Vec<Device>) -> Arc<Self> {
        let slots = devices
            .into_iter()
            .map(|device| Slot {
                device,
                reserved: false,
            })
            .collect();

        Arc::new(Self {
            kind,
            slots: Mutex::new(slots),
        })
    }

    /// Kind of device this pool hands out
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Total number of devices in the pool
    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of devices not currently leased
    pub fn available(&self) -> usize {
        self.slots.lock().iter().filter(|s| !s.reserved).count()
    }

    /// Reserve a free device
    pub fn acquire(self: &Arc<Self>) -> Result<DeviceLease, DeviceError> {
        let mut slots = self.slots.lock();
        let size = slots.len();

        let slot = slots
            .iter_mut()
            .find(|s| !s.reserved)
            .ok_or(DeviceError::PoolExhausted {
                kind: self.kind,
                size,
            })?;

        slot.reserved = true;
        debug!(kind = %self.kind, device_id = %slot.device.id, "Device reserved");

        Ok(DeviceLease {
            pool: Arc::clone(self),
            device: slot.device.clone(),
            released: AtomicBool::new(false),
        })
    }

    fn give_back(&self, id: &str) {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|s| s.device.id == id) {
            Some(slot) if slot.reserved => {
                slot.reserved = false;
                debug!(kind = %self.kind, device_id = %id, "Device released");
            }
            Some(_) => warn!(kind = %self.kind, device_id = %id, "Device was not reserved"),
            None => warn!(kind = %self.kind, device_id = %id, "Device does not belong to pool"),
        }
    }
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevicePool")
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive lease on one device
///
/// Releasing is idempotent: only the first call returns the device to its
/// pool, later calls are no-ops.
pub struct DeviceLease {
    pool: Arc<DevicePool>,
    device: Device,
    released: AtomicBool,
}

impl DeviceLease {
    /// The leased device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Identifier of the leased device
    pub fn id(&self) -> &str {
        &self.device.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Return the device to its pool
    ///
    /// Returns `true` if this call released the device, `false` if the lease
    /// had already been released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pool.give_back(&self.device.id);
        true
    }
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device)
            .field("released", &self.is_released())
            .finish()
    }
}
