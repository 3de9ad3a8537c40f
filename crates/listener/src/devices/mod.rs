//! Exclusive device allocation
//!
//! This module provides:
//! - [`DevicePool`] - Fixed pool of one device kind handing out [`DeviceLease`]s
//! - [`DeviceRegistry`] - Named pools shared by all tasks, with all-or-nothing
//!   per-task acquisition
//! - Pool constructors for loopback video, loopback audio and CPU sets

mod managers;
mod pool;
mod registry;

pub use managers::{
    cpu_set, cpu_set_from_host, loopback_audio, loopback_audio_from_dir, loopback_video,
    loopback_video_from_dir,
};
pub use pool::{Device, DeviceError, DeviceKind, DeviceLease, DevicePool};
pub use registry::{release_all, DeviceLeases, DeviceRegistry, CPU, LOOPBACK_AUDIO, LOOPBACK_VIDEO};
