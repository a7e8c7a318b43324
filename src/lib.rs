//! GPU and CPU hardware telemetry collection for Linux overlays.
//!
//! This library samples vendor-specific kernel interfaces (hwmon sensor
//! trees, drm render nodes and their fdinfo accounting, the amdgpu binary
//! metrics blob, NVML) on a background cadence and exposes the results as
//! coherent, thread-safe snapshots.
//!
//! # Usage
//!
//! ```no_run
//! use gpu_telemetry_collector::cpu::CpuCollector;
//! use gpu_telemetry_collector::gpu::enumerate::enumerate_gpus;
//!
//! // One supervised poll thread per discovered device
//! let gpus = enumerate_gpus();
//!
//! // The CPU collector is polled synchronously by its owner
//! let mut cpu = CpuCollector::new();
//! cpu.poll();
//!
//! for gpu in &gpus {
//!     let snapshot = gpu.system_snapshot();
//!     println!("{}: {}% {}W", gpu.info.drm_node, snapshot.load, snapshot.power_usage);
//! }
//! ```
//!
//! Everything degrades instead of failing: an interface that is missing on
//! this machine reads as zero/false and the affected device keeps running
//! with whatever its kernel driver does provide.

pub mod counter;
pub mod cpu;
pub mod fdinfo;
pub mod gpu;
pub mod hwmon;
pub mod memory;
pub mod snapshot;

// Re-export main types for convenience
pub use cpu::CpuCollector;
pub use gpu::enumerate::enumerate_gpus;
pub use gpu::{DeviceInfo, GpuDevice, VendorGpu};
pub use snapshot::{
    CpuCoreInfo, CpuInfo, DeviceSnapshots, GpuProcessSnapshot, GpuSystemSnapshot, MemoryInfo,
    ProcessMemoryInfo,
};
