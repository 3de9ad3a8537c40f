//! Disk-space back-pressure
//!
//! Before claiming, the listener asks whether the docker volume has room for
//! the number of tasks it is about to claim. Each claimable task needs
//! `threshold` bytes free; if free space does not exceed
//! `threshold * candidate_capacity`, the poll cycle claims nothing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::Disks;
use tracing::debug;

/// Disk-space measurement errors
#[derive(Debug, thiserror::Error)]
pub enum DiskspaceError {
    /// No mounted disk contains the path
    #[error("could not determine disk for path: {0}")]
    NoDisk(PathBuf),

    /// The blocking measurement task failed
    #[error("disk measurement failed: {0}")]
    Measurement(String),
}

/// Disk-space collaborator
#[async_trait]
pub trait DiskspaceCheck: Send + Sync {
    /// Whether claiming `candidate_capacity` more tasks would exceed the
    /// per-task free-space `threshold` (bytes) on the volume at `path`
    async fn exceeds_threshold(
        &self,
        path: &Path,
        threshold: u64,
        candidate_capacity: usize,
    ) -> Result<bool, DiskspaceError>;
}

/// Space figures for one disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
}

impl DiskUsage {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    /// Percentage of the disk in use
    pub fn pct_used(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        100.0 * self.used() as f64 / self.total as f64
    }

    /// Threshold rule shared by every implementation
    pub fn exceeds(&self, threshold: u64, candidate_capacity: usize) -> bool {
        let required = threshold.saturating_mul(candidate_capacity as u64);
        self.free <= required
    }
}

/// Measures the host's disks with `sysinfo`
#[derive(Debug, Clone, Default)]
pub struct SysinfoDiskspace;

impl SysinfoDiskspace {
    pub fn new() -> Self {
        Self
    }

    /// Usage of the disk whose mount point is the longest prefix of `path`
    pub fn measure(path: &Path) -> Result<DiskUsage, DiskspaceError> {
        let disks = Disks::new_with_refreshed_list();

        disks
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| DiskUsage {
                total: disk.total_space(),
                free: disk.available_space(),
            })
            .ok_or_else(|| DiskspaceError::NoDisk(path.to_path_buf()))
    }
}

#[async_trait]
impl DiskspaceCheck for SysinfoDiskspace {
    async fn exceeds_threshold(
        &self,
        path: &Path,
        threshold: u64,
        candidate_capacity: usize,
    ) -> Result<bool, DiskspaceError> {
        let owned = path.to_path_buf();
        let usage = tokio::task::spawn_blocking(move || Self::measure(&owned))
            .await
            .map_err(|e| DiskspaceError::Measurement(e.to_string()))??;

        let exceeds = usage.exceeds(threshold, candidate_capacity);
        debug!(
            volume = %path.display(),
            total = usage.total,
            used = usage.used(),
            free = usage.free,
            pct_used = usage.pct_used(),
            threshold,
            candidate_capacity,
            exceeds_threshold = exceeds,
            "Diskspace check"
        );

        Ok(exceeds)
    }
}

/// Settable disk-space answer for tests
///
/// Records the candidate capacity of every check.
#[derive(Debug, Default)]
pub struct FixedDiskspace {
    exceeded: AtomicBool,
    checks: Mutex<Vec<usize>>,
}

impl FixedDiskspace {
    pub fn new(exceeded: bool) -> Self {
        Self {
            exceeded: AtomicBool::new(exceeded),
            checks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_exceeded(&self, exceeded: bool) {
        self.exceeded.store(exceeded, Ordering::Relaxed);
    }

    /// Candidate capacities passed to every check so far
    pub fn checks(&self) -> Vec<usize> {
        self.checks.lock().clone()
    }
}

#[async_trait]
impl DiskspaceCheck for FixedDiskspace {
    async fn exceeds_threshold(
        &self,
        _path: &Path,
        _threshold: u64,
        candidate_capacity: usize,
    ) -> Result<bool, DiskspaceError> {
        self.checks.lock().push(candidate_capacity);
        Ok(self.exceeded.load(Ordering::Relaxed))
    }
}
