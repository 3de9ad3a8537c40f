//! Admission inputs: local capacity and disk-space back-pressure

mod counter;
mod diskspace;

pub use counter::{CapacityEvent, PendingCounter};
pub use diskspace::{DiskUsage, DiskspaceCheck, DiskspaceError, FixedDiskspace, SysinfoDiskspace};
