//! Pool constructors for the supported device kinds

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::pool::{Device, DeviceKind, DevicePool};

/// Loopback video pool over `/dev/video0` .. `/dev/video{count-1}`
pub fn loopback_video(count: usize) -> Arc<DevicePool> {
    DevicePool::new(
        DeviceKind::LoopbackVideo,
        (0..count).map(video_device).collect(),
    )
}

/// Loopback video pool over every `videoN` node found in `dev_dir`
pub fn loopback_video_from_dir(dev_dir: &Path) -> io::Result<Arc<DevicePool>> {
    let indices = scan_indices(dev_dir, "video")?;
    Ok(DevicePool::new(
        DeviceKind::LoopbackVideo,
        indices.into_iter().map(video_device).collect(),
    ))
}

/// Loopback audio pool over sound cards 0 .. `count-1`
pub fn loopback_audio(count: usize) -> Arc<DevicePool> {
    DevicePool::new(
        DeviceKind::LoopbackAudio,
        (0..count).map(audio_device).collect(),
    )
}

/// Loopback audio pool over every `controlCN` node found in `snd_dir`
pub fn loopback_audio_from_dir(snd_dir: &Path) -> io::Result<Arc<DevicePool>> {
    let indices = scan_indices(snd_dir, "controlC")?;
    Ok(DevicePool::new(
        DeviceKind::LoopbackAudio,
        indices.into_iter().map(audio_device).collect(),
    ))
}

/// CPU-set pool with one entry per core
pub fn cpu_set(cores: usize) -> Arc<DevicePool> {
    let devices = (0..cores)
        .map(|core| Device {
            id: core.to_string(),
            kind: DeviceKind::CpuSet,
            mount_points: vec![],
        })
        .collect();
    DevicePool::new(DeviceKind::CpuSet, devices)
}

/// CPU-set pool sized to the host's available parallelism
pub fn cpu_set_from_host() -> Arc<DevicePool> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpu_set(cores)
}

fn video_device(index: usize) -> Device {
    Device {
        id: index.to_string(),
        kind: DeviceKind::LoopbackVideo,
        mount_points: vec![PathBuf::from(format!("/dev/video{}", index))],
    }
}

fn audio_device(index: usize) -> Device {
    let snd = Path::new("/dev/snd");
    Device {
        id: index.to_string(),
        kind: DeviceKind::LoopbackAudio,
        mount_points: vec![
            snd.join(format!("controlC{}", index)),
            snd.join(format!("pcmC{}D0c", index)),
            snd.join(format!("pcmC{}D0p", index)),
            snd.join(format!("pcmC{}D1c", index)),
            snd.join(format!("pcmC{}D1p", index)),
        ],
    }
}

/// Sorted indices N of entries named `{prefix}N` in `dir`
fn scan_indices(dir: &Path, prefix: &str) -> io::Result<Vec<usize>> {
    let mut indices: Vec<usize> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            name.strip_prefix(prefix)?.parse().ok()
        })
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_video_mounts() {
        let pool = loopback_video(2);
        assert_eq!(pool.size(), 2);

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.device().mount_points, vec![PathBuf::from("/dev/video0")]);
    }

    #[test]
    fn test_loopback_audio_mounts() {
        let pool = loopback_audio(1);
        let lease = pool.acquire().unwrap();

        let mounts = &lease.device().mount_points;
        assert_eq!(mounts.len(), 5);
        assert_eq!(mounts[0], PathBuf::from("/dev/snd/controlC0"));
        assert_eq!(mounts[4], PathBuf::from("/dev/snd/pcmC0D1p"));
    }

    #[test]
    fn test_cpu_set_ids_are_core_indices() {
        let pool = cpu_set(4);
        let ids: Vec<String> = (0..4).map(|_| pool.acquire().unwrap().id().to_string()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_scan_indices() {
        let dir = std::env::temp_dir().join(format!("dockhand-scan-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["video3", "video1", "videoX", "audio0"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let pool = loopback_video_from_dir(&dir).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.acquire().unwrap().id(), "1");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_scan_missing_dir() {
        assert!(loopback_audio_from_dir(Path::new("/nonexistent/dockhand/snd")).is_err());
    }
}
