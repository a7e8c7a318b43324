//! Records published to consumers.
//!
//! Everything here is a plain value type: the poll threads build fresh
//! instances each cycle and publish them whole, readers always get copies.
//! Fields that a vendor cannot provide stay at their zero/false defaults.

use ahash::AHashMap as HashMap;
use serde::Serialize;

/// System-wide metrics for one GPU device.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GpuSystemSnapshot {
    /// Busy percentage, 0-100.
    pub load: i32,

    /// Dedicated video memory in use, GiB.
    pub vram_used: f32,
    /// System memory mapped for the GPU (GTT) in use, GiB.
    pub gtt_used: f32,
    /// Total dedicated video memory, GiB.
    pub memory_total: f32,
    /// Memory clock, MHz.
    pub memory_clock: i32,
    /// Memory temperature, °C.
    pub memory_temp: i32,

    /// Edge temperature, °C.
    pub temperature: i32,
    /// Junction (hotspot) temperature, °C.
    pub junction_temperature: i32,

    /// Core clock, MHz.
    pub core_clock: i32,
    /// Core voltage, mV.
    pub voltage: i32,

    /// Package power draw, W.
    pub power_usage: f32,
    /// Sustained power limit, W.
    pub power_limit: f32,

    /// Whether the device shares package power/thermals with the CPU.
    pub is_apu: bool,
    /// CPU-side package power on APUs, W.
    pub apu_cpu_power: f32,
    /// CPU-side temperature on APUs, °C.
    pub apu_cpu_temp: i32,

    pub is_power_throttled: bool,
    pub is_current_throttled: bool,
    pub is_temp_throttled: bool,
    pub is_other_throttled: bool,

    /// Fan speed; RPM when `fan_rpm` is set, percent otherwise.
    pub fan_speed: i32,
    /// Whether `fan_speed` is an RPM reading.
    pub fan_rpm: bool,
}

/// Per-process metrics on one GPU device.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GpuProcessSnapshot {
    /// Busy percentage attributable to this process, 0-100.
    pub load: i32,
    /// Dedicated video memory held by this process, GiB.
    pub vram_used: f32,
    /// GTT memory held by this process, GiB.
    pub gtt_used: f32,
}

/// System and per-process snapshots for one device, published together so a
/// reader never sees the two sides from different poll cycles.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshots {
    pub system: GpuSystemSnapshot,
    pub processes: HashMap<u32, GpuProcessSnapshot>,
}

/// One CPU core's load and frequency.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuCoreInfo {
    /// Busy percentage, 0-100.
    pub load: i32,
    /// Core frequency, MHz.
    pub frequency: i32,
}

/// Aggregate CPU metrics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuInfo {
    /// Whole-package busy percentage, 0-100.
    pub load: i32,
    /// Reported frequency = maximum across cores, MHz.
    pub frequency: i32,
    /// Package temperature, °C.
    pub temperature: i32,
    /// Package power draw, W.
    pub power: f32,
}

/// System RAM usage.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MemoryInfo {
    /// Total RAM, GiB.
    pub total: f32,
    /// RAM in use (total minus available), GiB.
    pub used: f32,
    /// Swap in use, GiB.
    pub swap_used: f32,
}

/// Per-process memory from the statm interface, bytes.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessMemoryInfo {
    pub resident: u64,
    pub shared: u64,
    pub virt: u64,
}
