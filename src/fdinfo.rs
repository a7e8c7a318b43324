//! Per-process GPU accounting through the drm fdinfo interface.
//!
//! Every file descriptor a process holds on a drm device exposes a
//! `/proc/<pid>/fdinfo/<fd>` text block of `key: value` lines with
//! driver-specific counters (engine time, resident memory). The same logical
//! device context can be reachable through several descriptors, so handles
//! are deduplicated by the driver-reported `drm-client-id` before any
//! aggregation.
//!
//! Processes may open additional device contexts long after startup (lazy
//! GPU initialization is common in games), so the handle set is rescanned on
//! a fixed interval instead of once at construction.

use ahash::AHashMap as HashMap;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often the handle set of a process is rediscovered.
const RESCAN_INTERVAL: Duration = Duration::from_secs(10);

/// One retained fdinfo handle: the open file plus its last parsed block.
struct Handle {
    file: File,
    data: HashMap<String, String>,
}

/// All retained fdinfo handles of one process on one device.
pub struct ProcessHandles {
    drm_node: String,
    proc_dir: PathBuf,
    handles: Vec<Handle>,
    last_scan: Instant,
}

impl ProcessHandles {
    /// `proc_dir` is the process directory, e.g. `/proc/1234`.
    pub fn new(drm_node: &str, proc_dir: PathBuf) -> Self {
        let mut this = Self {
            drm_node: drm_node.to_string(),
            proc_dir,
            handles: Vec::new(),
            last_scan: Instant::now(),
        };
        this.rescan();
        this
    }

    /// Re-enumerates the process's descriptors and reopens matching fdinfo
    /// files, deduplicated by `drm-client-id`.
    fn rescan(&mut self) {
        self.handles.clear();
        self.last_scan = Instant::now();

        let fds = self.find_device_fds();
        let mut client_ids: HashSet<String> = HashSet::new();
        let total_fds = fds.len();

        for fd in fds {
            let path = self.proc_dir.join("fdinfo").join(&fd);

            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    debug!("fdinfo: failed to open {:?}: {}", path, e);
                    continue;
                }
            };

            let mut content = String::new();
            if file.read_to_string(&mut content).is_err() {
                continue;
            }

            let data = parse_key_value_block(&content);
            let client_id = match data.get("drm-client-id") {
                Some(id) => id.clone(),
                None => continue,
            };

            // several fds may reference the same context; keep only the first
            // to avoid double counting
            if !client_ids.insert(client_id) {
                continue;
            }

            self.handles.push(Handle { file, data });
        }

        debug!(
            "fdinfo: {:?}: {} fds scanned, {} unique contexts kept",
            self.proc_dir,
            total_fds,
            self.handles.len()
        );
    }

    /// Descriptors under `<proc_dir>/fd` that point at this device node.
    fn find_device_fds(&self) -> Vec<String> {
        let fd_dir = self.proc_dir.join("fd");

        let entries = match fs::read_dir(&fd_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("fdinfo: {:?} not readable: {}", fd_dir, e);
                return Vec::new();
            }
        };

        let mut fds = Vec::new();

        for entry in entries.flatten() {
            let link = match fs::read_link(entry.path()) {
                Ok(link) => link,
                Err(_) => continue,
            };

            // some processes (containers in particular) open the primary
            // card node instead of the render node
            let is_render_node = link
                .file_name()
                .map(|n| n.to_string_lossy() == self.drm_node)
                .unwrap_or(false);
            let is_card_node = link.to_string_lossy().starts_with("/dev/dri/card");

            if !is_render_node && !is_card_node {
                continue;
            }

            fds.push(entry.file_name().to_string_lossy().to_string());
        }

        fds
    }

    /// Re-reads every retained handle's block, rescanning the handle set
    /// first when the rescan interval has elapsed.
    pub fn poll(&mut self) {
        if self.last_scan.elapsed() >= RESCAN_INTERVAL {
            self.rescan();
        }

        for handle in &mut self.handles {
            if handle.file.seek(SeekFrom::Start(0)).is_err() {
                continue;
            }

            let mut content = String::new();
            if handle.file.read_to_string(&mut content).is_err() {
                continue;
            }

            for (key, value) in parse_key_value_block(&content) {
                handle.data.insert(key, value);
            }
        }
    }

    /// Sum of `key` across handles, interpreted as a nanosecond engine-time
    /// counter.
    pub fn engine_time_ns(&self, key: &str) -> u64 {
        self.handles
            .iter()
            .filter_map(|h| h.data.get(key))
            .filter_map(|v| parse_leading_u64(v))
            .sum()
    }

    /// Sum of `key` across handles, normalized from the per-handle binary
    /// unit suffix (KiB/MiB) to GiB.
    pub fn memory_used_gib(&self, key: &str) -> f32 {
        let mut total = 0.0f32;

        for handle in &self.handles {
            let value = match handle.data.get(key) {
                Some(value) if !value.is_empty() => value,
                _ => continue,
            };

            let amount = match parse_leading_u64(value) {
                Some(amount) => amount as f32,
                None => continue,
            };

            if value.contains("KiB") {
                total += amount / 1024.0 / 1024.0;
            } else if value.contains("MiB") {
                total += amount / 1024.0;
            } else {
                total += amount;
            }
        }

        total
    }

    /// Raw value of `key` on the first handle, if any.
    pub fn first_value(&self, key: &str) -> Option<&str> {
        self.handles.first().and_then(|h| h.data.get(key).map(String::as_str))
    }

    /// The parsed key/value block of every retained handle.
    pub fn handle_blocks(&self) -> impl Iterator<Item = &HashMap<String, String>> {
        self.handles.iter().map(|h| &h.data)
    }

    pub fn has_handles(&self) -> bool {
        !self.handles.is_empty()
    }
}

/// Tracks fdinfo state for every registered process on one device.
pub struct FdinfoAccountant {
    drm_node: String,
    proc_root: PathBuf,
    processes: HashMap<u32, ProcessHandles>,
}

impl FdinfoAccountant {
    pub fn new(drm_node: &str) -> Self {
        Self::with_proc_root(drm_node, PathBuf::from("/proc"))
    }

    pub fn with_proc_root(drm_node: &str, proc_root: PathBuf) -> Self {
        Self {
            drm_node: drm_node.to_string(),
            proc_root,
            processes: HashMap::new(),
        }
    }

    /// Starts accounting for `pid` if it is not already tracked.
    pub fn add_pid(&mut self, pid: u32) {
        if !self.processes.contains_key(&pid) {
            debug!("fdinfo: adding pid {}", pid);
            let proc_dir = self.proc_root.join(pid.to_string());
            self.processes
                .insert(pid, ProcessHandles::new(&self.drm_node, proc_dir));
        }
    }

    /// Polls every tracked process, dropping the ones whose proc directory
    /// no longer exists. Process exit is routine, not an error.
    pub fn poll_all(&mut self) {
        let proc_root = self.proc_root.clone();
        self.processes.retain(|pid, handles| {
            if !proc_root.join(pid.to_string()).exists() {
                debug!("fdinfo: dropping exited pid {}", pid);
                return false;
            }
            handles.poll();
            true
        });
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessHandles> {
        self.processes.get(&pid)
    }

    pub fn engine_time_ns(&self, pid: u32, key: &str) -> u64 {
        self.get(pid).map(|p| p.engine_time_ns(key)).unwrap_or(0)
    }

    pub fn memory_used_gib(&self, pid: u32, key: &str) -> f32 {
        self.get(pid).map(|p| p.memory_used_gib(key)).unwrap_or(0.0)
    }

    /// First tracked process that has at least one handle, if any. Some
    /// device-wide values (Panfrost's current frequency) are only reachable
    /// through a process handle and are identical across processes.
    pub fn any_process(&self) -> Option<&ProcessHandles> {
        self.processes.values().find(|p| p.has_handles())
    }
}

fn parse_key_value_block(content: &str) -> HashMap<String, String> {
    let mut data = HashMap::new();

    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            data.insert(key.to_string(), value.trim().to_string());
        }
    }

    data
}

/// Parses the numeric prefix of a value like `1234 KiB` or `5678 ns`.
fn parse_leading_u64(value: &str) -> Option<u64> {
    let digits = value.trim_start();
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}
