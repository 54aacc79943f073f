//! LTFS mount/unmount/format: the layer through which a loaded cartridge
//! becomes a directory of chunk files. Two implementations mirror the
//! changer split: one shells out to the real LTFS tooling, the other
//! operates on plain directories for `--mock` runs and tests.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::MediaError;

pub trait LtfsDriver: Send {
    /// Mount the cartridge identified by `serial` and return its mount
    /// point.
    fn mount(&mut self, serial: &str) -> Result<PathBuf, MediaError>;
    fn unmount(&mut self, serial: &str) -> Result<(), MediaError>;
    /// Format a freshly allocated scratch cartridge before first use.
    fn format(&mut self, serial: &str) -> Result<(), MediaError>;
}

fn run(command: &mut Command) -> Result<(), MediaError> {
    let output = command
        .output()
        .map_err(|err| MediaError::MountFailed(format!("failed to execute {command:?} - {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = if stderr.trim().is_empty() {
            "no error message".to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(MediaError::MountFailed(format!("{command:?} failed: {stderr}")));
    }

    Ok(())
}

/// Mounts real LTFS-formatted media via the system `ltfs`/`mkltfs`/`umount`
/// tooling. `device` is the drive's tape device node; `root` is the
/// directory under which this drive's cartridges are mounted.
pub struct ExternalLtfs {
    device: String,
    root: PathBuf,
}

impl ExternalLtfs {
    pub fn new(device: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        ExternalLtfs {
            device: device.into(),
            root: root.into(),
        }
    }

    fn mount_point(&self, serial: &str) -> PathBuf {
        self.root.join(serial)
    }
}

impl LtfsDriver for ExternalLtfs {
    fn mount(&mut self, serial: &str) -> Result<PathBuf, MediaError> {
        let mount_point = self.mount_point(serial);
        std::fs::create_dir_all(&mount_point)
            .map_err(|err| MediaError::MountFailed(err.to_string()))?;

        run(Command::new("ltfs")
            .arg(format!("-o devname={}", self.device))
            .arg(&mount_point))?;

        Ok(mount_point)
    }

    fn unmount(&mut self, serial: &str) -> Result<(), MediaError> {
        run(Command::new("fusermount").arg("-u").arg(self.mount_point(serial)))
    }

    fn format(&mut self, _serial: &str) -> Result<(), MediaError> {
        run(Command::new("mkltfs").arg("-d").arg(&self.device).arg("-f"))
    }
}

#[derive(Clone, Copy, Default)]
pub struct MockLtfsTimings {
    pub mount: Duration,
    pub unmount: Duration,
    pub format: Duration,
}

/// Stand-in for a real LTFS mount: each cartridge gets a plain subdirectory
/// of `root` named after its serial. Used under `--mock` and in tests so the
/// write path can be exercised without tape hardware.
pub struct MockLtfs {
    root: PathBuf,
    timings: MockLtfsTimings,
}

impl MockLtfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MockLtfs {
            root: root.into(),
            timings: MockLtfsTimings::default(),
        }
    }

    pub fn with_timings(root: impl Into<PathBuf>, timings: MockLtfsTimings) -> Self {
        MockLtfs {
            root: root.into(),
            timings,
        }
    }

    fn mount_point(&self, serial: &str) -> PathBuf {
        self.root.join(serial)
    }
}

impl LtfsDriver for MockLtfs {
    fn mount(&mut self, serial: &str) -> Result<PathBuf, MediaError> {
        std::thread::sleep(self.timings.mount);
        let mount_point = self.mount_point(serial);
        std::fs::create_dir_all(&mount_point).map_err(|err| MediaError::MountFailed(err.to_string()))?;
        Ok(mount_point)
    }

    fn unmount(&mut self, _serial: &str) -> Result<(), MediaError> {
        std::thread::sleep(self.timings.unmount);
        Ok(())
    }

    fn format(&mut self, serial: &str) -> Result<(), MediaError> {
        std::thread::sleep(self.timings.format);
        let mount_point = self.mount_point(serial);
        if mount_point.exists() {
            std::fs::remove_dir_all(&mount_point).map_err(|err| MediaError::FormatFailed(err.to_string()))?;
        }
        std::fs::create_dir_all(&mount_point).map_err(|err| MediaError::FormatFailed(err.to_string()))?;
        Ok(())
    }
}

/// Build the on-tape path for one chunk file, relative to a mount point.
/// `drive_kind` is `"read"` or `"write"` per the config's drive type.
pub fn chunk_file_name(sequence: u64, archive: &str, chunk_id: u64) -> String {
    format!("{sequence:07}-{archive}.cnk{chunk_id:07}")
}

pub fn chunk_path(mount_point: &Path, sequence: u64, archive: &str, chunk_id: u64) -> PathBuf {
    mount_point.join(chunk_file_name(sequence, archive, chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mock_mount_creates_directory() {
        let dir = tempdir().unwrap();
        let mut ltfs = MockLtfs::new(dir.path());
        let mount_point = ltfs.mount("VOL001").unwrap();
        assert!(mount_point.is_dir());
    }

    #[test]
    fn mock_format_clears_existing_contents() {
        let dir = tempdir().unwrap();
        let mut ltfs = MockLtfs::new(dir.path());
        let mount_point = ltfs.mount("VOL001").unwrap();
        std::fs::write(mount_point.join("stale.cnk"), b"old").unwrap();
        ltfs.format("VOL001").unwrap();
        assert_eq!(std::fs::read_dir(&mount_point).unwrap().count(), 0);
    }

    #[test]
    fn chunk_file_name_zero_pads_all_fields() {
        assert_eq!(chunk_file_name(3, "myarchive", 12), "0000003-myarchive.cnk0000012");
    }
}
