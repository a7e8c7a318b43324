//! Memory-region queries against the Intel drm character device.
//!
//! VRAM totals are not exposed through sysfs on Intel; they come from a
//! device ioctl. The *total* region size is world-readable, but the
//! *used* size counts as detailed accounting and requires CAP_PERFMON (or
//! root) — without it the query still succeeds and used memory reads as
//! zero.

use nix::errno::Errno;
use nix::unistd::geteuid;
use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::{debug, error, trace};

const DRM_I915_QUERY_MEMORY_REGIONS: u64 = 4;
const I915_MEMORY_CLASS_DEVICE: u16 = 1;

const DRM_XE_DEVICE_QUERY_MEM_REGIONS: u32 = 1;
const DRM_XE_MEM_REGION_CLASS_VRAM: u16 = 1;

// CAP_PERFMON bit in the CapEff mask of /proc/self/status.
const CAP_PERFMON: u32 = 38;

#[repr(C)]
#[derive(Default)]
struct DrmI915QueryItem {
    query_id: u64,
    length: i32,
    flags: u32,
    data_ptr: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmI915Query {
    num_items: u32,
    flags: u32,
    items_ptr: u64,
}

#[repr(C)]
#[derive(Default)]
struct DrmXeDeviceQuery {
    extensions: u64,
    query: u32,
    size: u32,
    data: u64,
    reserved: [u64; 2],
}

nix::ioctl_readwrite!(i915_query_ioctl, 'd', 0x79, DrmI915Query);
nix::ioctl_readwrite!(xe_device_query_ioctl, 'd', 0x40, DrmXeDeviceQuery);

/// Which generation's query protocol the device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    I915,
    Xe,
}

/// One device's memory-region query state.
pub struct MemoryRegionQuery {
    kind: QueryKind,
    card: Option<File>,
    has_cap_perfmon: bool,
    total_memory: u64,
    used_memory: u64,
}

impl MemoryRegionQuery {
    pub fn new(kind: QueryKind) -> Self {
        let has_cap_perfmon = effective_capability(CAP_PERFMON);
        debug!("has_cap_perfmon = {}", has_cap_perfmon);

        Self {
            kind,
            card: None,
            has_cap_perfmon,
            total_memory: 0,
            used_memory: 0,
        }
    }

    /// Opens the drm card node; returns false when the device cannot be
    /// queried (non-fatal, memory values stay at zero).
    pub fn setup(&mut self, card: &Path) -> bool {
        match OpenOptions::new().write(true).open(card) {
            Ok(file) => {
                self.card = Some(file);
                true
            }
            Err(e) => {
                error!("failed to open {:?}: {}", card, e);
                false
            }
        }
    }

    /// Re-queries the device's memory regions, keeping previous values on
    /// failure.
    pub fn poll(&mut self) {
        let fd = match &self.card {
            Some(card) => card.as_raw_fd(),
            None => return,
        };

        let regions = match self.kind {
            QueryKind::I915 => query_i915_regions(fd),
            QueryKind::Xe => query_xe_regions(fd),
        };

        match regions {
            Some((total, used)) => {
                self.total_memory = total;
                self.used_memory = used;

                trace!("total_memory = {} MiB", total as f32 / 1024.0 / 1024.0);
                trace!("used_memory  = {} MiB", used as f32 / 1024.0 / 1024.0);
            }
            None => trace!("memory region query returned nothing"),
        }
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    /// Used device memory; reads as zero without CAP_PERFMON or root.
    pub fn used_memory(&self) -> u64 {
        if !self.has_cap_perfmon && !geteuid().is_root() {
            return 0;
        }

        self.used_memory
    }
}

/// Repeats the ioctl across EINTR/EAGAIN like every drm consumer does.
fn retry_ioctl(mut call: impl FnMut() -> nix::Result<i32>) -> nix::Result<i32> {
    loop {
        match call() {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            other => return other,
        }
    }
}

/// Two-call i915 query: first for the buffer length, then for the data.
/// Returns the device-class region's (total, used) when present.
fn query_i915_regions(fd: i32) -> Option<(u64, u64)> {
    let mut item = DrmI915QueryItem {
        query_id: DRM_I915_QUERY_MEMORY_REGIONS,
        ..Default::default()
    };
    let mut query = DrmI915Query {
        num_items: 1,
        flags: 0,
        items_ptr: &mut item as *mut _ as u64,
    };

    // SAFETY: query and item stay alive across the call; the kernel writes
    // only the length field on this first pass
    let ret = retry_ioctl(|| unsafe { i915_query_ioctl(fd, &mut query) });
    if ret.is_err() || item.length <= 0 {
        return None;
    }

    let mut buf = vec![0u8; item.length as usize];
    item.data_ptr = buf.as_mut_ptr() as u64;

    // SAFETY: data_ptr points at a buffer of exactly the length the kernel
    // asked for
    let ret = retry_ioctl(|| unsafe { i915_query_ioctl(fd, &mut query) });
    if ret.is_err() || item.length <= 0 {
        return None;
    }

    // struct drm_i915_query_memory_regions: num_regions u32, rsvd[3],
    // then 88-byte region entries
    let num_regions = u32_at(&buf, 0)? as usize;
    for i in 0..num_regions {
        let base = 16 + i * 88;
        let memory_class = u16_at(&buf, base)?;

        if memory_class != I915_MEMORY_CLASS_DEVICE {
            continue;
        }

        let probed_size = u64_at(&buf, base + 8)?;
        let unallocated_size = u64_at(&buf, base + 16)?;
        return Some((probed_size, probed_size.saturating_sub(unallocated_size)));
    }

    None
}

/// Two-call xe query: size probe, then data fetch.
fn query_xe_regions(fd: i32) -> Option<(u64, u64)> {
    let mut query = DrmXeDeviceQuery {
        query: DRM_XE_DEVICE_QUERY_MEM_REGIONS,
        ..Default::default()
    };

    // SAFETY: the kernel fills in the required size on this first pass
    let ret = retry_ioctl(|| unsafe { xe_device_query_ioctl(fd, &mut query) });
    if ret.is_err() || query.size == 0 {
        return None;
    }

    let mut buf = vec![0u8; query.size as usize];
    query.data = buf.as_mut_ptr() as u64;

    // SAFETY: data points at a buffer of the size the kernel asked for
    let ret = retry_ioctl(|| unsafe { xe_device_query_ioctl(fd, &mut query) });
    if ret.is_err() {
        return None;
    }

    // struct drm_xe_query_mem_regions: num_mem_regions u32, pad u32, then
    // 80-byte region entries
    let num_regions = u32_at(&buf, 0)? as usize;
    for i in 0..num_regions {
        let base = 8 + i * 80;
        let mem_class = u16_at(&buf, base)?;

        if mem_class != DRM_XE_MEM_REGION_CLASS_VRAM {
            continue;
        }

        let total_size = u64_at(&buf, base + 8)?;
        let used = u64_at(&buf, base + 16)?;
        return Some((total_size, used));
    }

    None
}

/// Whether the given capability bit is set in this process's effective set.
fn effective_capability(bit: u32) -> bool {
    let status = match fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return false,
    };

    for line in status.lines() {
        if let Some(mask) = line.strip_prefix("CapEff:") {
            if let Ok(mask) = u64::from_str_radix(mask.trim(), 16) {
                return (mask >> bit) & 1 == 1;
            }
        }
    }

    false
}

fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn u64_at(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8).map(|b| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        u64::from_le_bytes(raw)
    })
}
