//! Intel GPU drivers.
//!
//! Two kernel driver generations share most of their plumbing: hwmon
//! sensors, an energy-counter-derived power reading, a "gt" sysfs directory
//! carrying the actual core clock and per-reason throttle files, and a
//! privileged ioctl query for memory-region sizes. The generations differ
//! in where the gt directory lives, in sensor channel numbers, and in how
//! per-process load is computed.

pub mod drm;
pub mod i915;
pub mod xe;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

const THROTTLE_POWER_REASONS: &[&str] = &["reason_pl1", "reason_pl2"];
const THROTTLE_CURRENT_REASONS: &[&str] = &["reason_pl4", "reason_vr_tdc"];
const THROTTLE_TEMP_REASONS: &[&str] = &[
    "reason_prochot",
    "reason_ratl",
    "reason_thermal",
    "reason_vr_thermalert",
];

/// Decoded per-category throttle state for one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleStatus {
    pub power: bool,
    pub current: bool,
    pub temp: bool,
    pub other: bool,
}

/// Open handles on the gt throttle files of one device.
pub struct ThrottleReasons {
    status: File,
    power: Vec<File>,
    current: Vec<File>,
    temp: Vec<File>,
}

impl ThrottleReasons {
    /// Opens `<dir>/<prefix><status|reason_*>`. Returns `None` when the
    /// status file is missing; individual missing reason files are skipped
    /// with a warning.
    pub fn open(dir: &Path, status_name: &str, prefix: &str) -> Option<Self> {
        let status_path = dir.join(format!("{}{}", prefix, status_name));
        let status = match File::open(&status_path) {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to open {:?}: {}. throttle status will not work", status_path, e);
                return None;
            }
        };

        let open_reasons = |reasons: &[&str]| -> Vec<File> {
            reasons
                .iter()
                .filter_map(|reason| {
                    let path = dir.join(format!("{}{}", prefix, reason));
                    match File::open(&path) {
                        Ok(file) => Some(file),
                        Err(e) => {
                            warn!("throttle file {:?} not available: {}", path, e);
                            None
                        }
                    }
                })
                .collect()
        };

        Some(Self {
            status,
            power: open_reasons(THROTTLE_POWER_REASONS),
            current: open_reasons(THROTTLE_CURRENT_REASONS),
            temp: open_reasons(THROTTLE_TEMP_REASONS),
        })
    }

    /// Re-reads the status and reason files for this cycle.
    pub fn poll(&mut self) -> ThrottleStatus {
        if read_flag(&mut self.status) != Some(true) {
            return ThrottleStatus::default();
        }

        let mut status = ThrottleStatus {
            power: any_flag_set(&mut self.power),
            current: any_flag_set(&mut self.current),
            temp: any_flag_set(&mut self.temp),
            other: false,
        };

        // throttled, but no known reason file asserts: fall into "other"
        if !status.power && !status.current && !status.temp {
            status.other = true;
        }

        status
    }
}

fn any_flag_set(files: &mut [File]) -> bool {
    files.iter_mut().any(|file| read_flag(file) == Some(true))
}

fn read_flag(file: &mut File) -> Option<bool> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    Some(content.trim() == "1")
}

/// Reads one line from a kept-open sysfs file and parses it as an integer.
/// Empty or unreadable content yields 0.
pub(crate) fn read_sysfs_int(file: &mut Option<File>) -> i32 {
    let file = match file {
        Some(file) => file,
        None => return 0,
    };

    if file.seek(SeekFrom::Start(0)).is_err() {
        return 0;
    }

    let mut content = String::new();
    if file.read_to_string(&mut content).is_err() {
        return 0;
    }

    content.trim().parse().unwrap_or(0)
}

pub(crate) fn open_logged(path: &Path, what: &str) -> Option<File> {
    match File::open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("failed to open {:?}: {}. {} will not be available", path, e, what);
            None
        }
    }
}

/// First `card*` entry below `<node>/device/drm`, the i915 gt root.
pub(crate) fn find_card_dir(node_path: &Path) -> Option<std::path::PathBuf> {
    let device = node_path.join("device/drm");

    let entries = match std::fs::read_dir(&device) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("{:?} not readable: {}", device, e);
            return None;
        }
    };

    entries
        .flatten()
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().starts_with("card"))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_throttle_dir(dir: &Path, prefix: &str, status: &str, asserted: &[&str]) {
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(dir.join(format!("{}reason_status", prefix)), status).expect("write");

        for reason in THROTTLE_POWER_REASONS
            .iter()
            .chain(THROTTLE_CURRENT_REASONS)
            .chain(THROTTLE_TEMP_REASONS)
        {
            let value = if asserted.contains(reason) { "1\n" } else { "0\n" };
            fs::write(dir.join(format!("{}{}", prefix, reason)), value).expect("write");
        }
    }

    #[test]
    fn test_no_throttle_when_status_clear() {
        let dir = tempdir().expect("tempdir");
        write_throttle_dir(dir.path(), "throttle_", "0\n", &["reason_pl1"]);

        let mut reasons =
            ThrottleReasons::open(dir.path(), "reason_status", "throttle_").expect("open");
        let status = reasons.poll();
        assert!(!status.power && !status.current && !status.temp && !status.other);
    }

    #[test]
    fn test_reason_categories() {
        let dir = tempdir().expect("tempdir");
        write_throttle_dir(dir.path(), "throttle_", "1\n", &["reason_pl2", "reason_prochot"]);

        let mut reasons =
            ThrottleReasons::open(dir.path(), "reason_status", "throttle_").expect("open");
        let status = reasons.poll();
        assert!(status.power);
        assert!(!status.current);
        assert!(status.temp);
        assert!(!status.other);
    }

    #[test]
    fn test_unattributed_throttle_reports_other() {
        let dir = tempdir().expect("tempdir");
        write_throttle_dir(dir.path(), "throttle_", "1\n", &[]);

        let mut reasons =
            ThrottleReasons::open(dir.path(), "reason_status", "throttle_").expect("open");
        let status = reasons.poll();
        assert!(!status.power && !status.current && !status.temp);
        assert!(status.other);
    }

    #[test]
    fn test_missing_status_file_disables_throttling() {
        let dir = tempdir().expect("tempdir");
        assert!(ThrottleReasons::open(dir.path(), "reason_status", "throttle_").is_none());
    }
}
