//! System RAM and per-process memory readings.
//!
//! RAM comes from the machine-wide meminfo key/value file; per-process
//! resident/shared/virtual sizes come from the three leading fields of the
//! process's statm file, scaled by the page size.

use once_cell::sync::Lazy;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::snapshot::{MemoryInfo, ProcessMemoryInfo};

const PROC_MEMINFO: &str = "/proc/meminfo";

/// Page size in bytes for statm scaling.
static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf is safe to call with _SC_PAGESIZE; a failure returns
    // -1 which the fallback below covers
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as u64
    } else {
        4096
    }
});

/// Reads total/used/swap-used RAM in GiB.
pub fn read_ram_info() -> MemoryInfo {
    read_ram_info_from(Path::new(PROC_MEMINFO))
}

pub fn read_ram_info_from(path: &Path) -> MemoryInfo {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("can't open {:?}: {}", path, e);
            return MemoryInfo::default();
        }
    };

    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    let mut swap_total_kb = 0u64;
    let mut swap_free_kb = 0u64;

    for line in content.lines() {
        let (key, value) = match line.split_once(':') {
            Some((key, value)) => (key, value),
            None => continue,
        };

        let kb: u64 = match value.trim().split_whitespace().next().and_then(|v| v.parse().ok()) {
            Some(kb) => kb,
            None => continue,
        };

        match key {
            "MemTotal" => total_kb = kb,
            "MemAvailable" => available_kb = kb,
            "SwapTotal" => swap_total_kb = kb,
            "SwapFree" => swap_free_kb = kb,
            _ => {}
        }
    }

    let to_gib = |kb: u64| kb as f32 / 1024.0 / 1024.0;

    MemoryInfo {
        total: to_gib(total_kb),
        used: to_gib(total_kb.saturating_sub(available_kb)),
        swap_used: to_gib(swap_total_kb.saturating_sub(swap_free_kb)),
    }
}

/// Reads a process's resident/shared/virtual memory in bytes from its proc
/// directory. A vanished process yields a zeroed record.
pub fn read_process_memory(proc_dir: &Path) -> ProcessMemoryInfo {
    let statm = proc_dir.join("statm");

    let content = match fs::read_to_string(&statm) {
        Ok(content) => content,
        Err(e) => {
            debug!("can't open {:?}: {}", statm, e);
            return ProcessMemoryInfo::default();
        }
    };

    // statm: size resident shared text lib data dt (pages)
    let mut fields = content.split_whitespace().filter_map(|v| v.parse::<u64>().ok());
    let virt_pages = fields.next().unwrap_or(0);
    let resident_pages = fields.next().unwrap_or(0);
    let shared_pages = fields.next().unwrap_or(0);

    ProcessMemoryInfo {
        resident: resident_pages * *PAGE_SIZE,
        shared: shared_pages * *PAGE_SIZE,
        virt: virt_pages * *PAGE_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ram_info_used_is_total_minus_available() {
        let dir = tempdir().expect("tempdir");
        let meminfo = "\
MemTotal:       16777216 kB\n\
MemFree:         2097152 kB\n\
MemAvailable:    8388608 kB\n\
SwapTotal:       4194304 kB\n\
SwapFree:        3145728 kB\n";
        let path = dir.path().join("meminfo");
        std::fs::write(&path, meminfo).expect("write");

        let info = read_ram_info_from(&path);
        assert!((info.total - 16.0).abs() < 1e-6);
        assert!((info.used - 8.0).abs() < 1e-6);
        assert!((info.swap_used - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_meminfo_yields_zeroes() {
        let info = read_ram_info_from(Path::new("/nonexistent/meminfo"));
        assert_eq!(info.total, 0.0);
        assert_eq!(info.used, 0.0);
    }

    #[test]
    fn test_process_memory_scales_by_page_size() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("statm"), "100 60 20 5 0 40 0\n").expect("write");

        let info = read_process_memory(dir.path());
        assert_eq!(info.virt, 100 * *PAGE_SIZE);
        assert_eq!(info.resident, 60 * *PAGE_SIZE);
        assert_eq!(info.shared, 20 * *PAGE_SIZE);
    }

    #[test]
    fn test_vanished_process_yields_zeroes() {
        let info = read_process_memory(Path::new("/nonexistent/proc/99999"));
        assert_eq!(info.resident, 0);
        assert_eq!(info.virt, 0);
    }
}
