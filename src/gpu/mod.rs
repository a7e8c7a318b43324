//! GPU device supervision: vendor driver abstraction and per-device poll
//! threads.
//!
//! Each discovered device runs exactly one background poll loop that asks
//! its vendor driver for every capability value once per second, recomputes
//! the per-process records, and publishes the whole pair atomically.
//! Readers always receive copies taken under the snapshot lock, never a
//! live reference into the poll thread's state.

pub mod amdgpu;
pub mod enumerate;
pub mod gpu_metrics;
pub mod intel;
pub mod msm;
pub mod nvidia;
pub mod panfrost;

use ahash::AHashMap as HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::snapshot::{DeviceSnapshots, GpuProcessSnapshot, GpuSystemSnapshot};

/// Interval between poll cycles.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of one enumerated render node.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Render node name, e.g. `renderD128`.
    pub drm_node: String,
    /// Sysfs path of the node, e.g. `/sys/class/drm/renderD128`.
    pub node_path: PathBuf,
    /// PCI bus address, e.g. `0000:03:00.0`; empty for non-PCI devices.
    pub pci_dev: String,
    pub vendor_id: u32,
    pub device_id: u32,
    /// Kernel driver name the node resolved to.
    pub driver: String,
}

/// Capability surface of one vendor driver.
///
/// Every getter defaults to "unavailable" (zero/false); variants override
/// only what their kernel interface provides. `fan_rpm` defaults to true:
/// fan readings are RPM unless a vendor reports percentages.
///
/// Getters take `&mut self` because several of them advance delta baselines
/// on read; the supervisor invokes them in a fixed order once per cycle.
pub trait VendorGpu: Send {
    /// Short driver name used for the worker thread and diagnostics.
    fn name(&self) -> &'static str;

    /// Refreshes backing sources (sensors, fdinfo, metrics blob) before the
    /// getters run. `delta` is the interval since the previous cycle and is
    /// the denominator for every rate computed in it.
    fn pre_poll(&mut self, delta: Duration) {
        let _ = delta;
    }

    fn load(&mut self) -> i32 {
        0
    }

    fn vram_used(&mut self) -> f32 {
        0.0
    }
    fn gtt_used(&mut self) -> f32 {
        0.0
    }
    fn memory_total(&mut self) -> f32 {
        0.0
    }
    fn memory_clock(&mut self) -> i32 {
        0
    }
    fn memory_temp(&mut self) -> i32 {
        0
    }

    fn temperature(&mut self) -> i32 {
        0
    }
    fn junction_temperature(&mut self) -> i32 {
        0
    }

    fn core_clock(&mut self) -> i32 {
        0
    }
    fn voltage(&mut self) -> i32 {
        0
    }

    fn power_usage(&mut self) -> f32 {
        0.0
    }
    fn power_limit(&mut self) -> f32 {
        0.0
    }

    fn is_apu(&mut self) -> bool {
        false
    }
    fn apu_cpu_power(&mut self) -> f32 {
        0.0
    }
    fn apu_cpu_temp(&mut self) -> i32 {
        0
    }

    fn is_power_throttled(&mut self) -> bool {
        false
    }
    fn is_current_throttled(&mut self) -> bool {
        false
    }
    fn is_temp_throttled(&mut self) -> bool {
        false
    }
    fn is_other_throttled(&mut self) -> bool {
        false
    }

    fn fan_speed(&mut self) -> i32 {
        0
    }
    fn fan_rpm(&mut self) -> bool {
        true
    }

    /// Called once when a pid is first tracked on this device.
    fn register_pid(&mut self, pid: u32) {
        let _ = pid;
    }

    fn process_load(&mut self, pid: u32, delta: Duration) -> i32 {
        let _ = (pid, delta);
        0
    }
    fn process_vram_used(&mut self, pid: u32) -> f32 {
        let _ = pid;
        0.0
    }
    fn process_gtt_used(&mut self, pid: u32) -> f32 {
        let _ = pid;
        0.0
    }
}

struct DeviceShared {
    stop: AtomicBool,
    is_active: AtomicBool,
    snapshots: Mutex<DeviceSnapshots>,
    /// Pids registered by consumers, adopted by the poll thread at the top
    /// of its next cycle. Pruning happens only on the poll thread.
    pending_pids: Mutex<Vec<u32>>,
}

/// One supervised GPU device: identity plus its background poll loop.
///
/// The worker stops and joins on drop; destruction blocks until the cycle
/// in flight completes.
pub struct GpuDevice {
    pub info: DeviceInfo,
    shared: Arc<DeviceShared>,
    worker: Option<JoinHandle<()>>,
}

impl GpuDevice {
    /// Starts the poll loop for `vendor` at the standard 1 s cadence.
    pub fn spawn(info: DeviceInfo, vendor: Box<dyn VendorGpu>) -> Self {
        Self::spawn_with_interval(info, vendor, POLL_INTERVAL)
    }

    pub fn spawn_with_interval(
        info: DeviceInfo,
        vendor: Box<dyn VendorGpu>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(DeviceShared {
            stop: AtomicBool::new(false),
            is_active: AtomicBool::new(false),
            snapshots: Mutex::new(DeviceSnapshots::default()),
            pending_pids: Mutex::new(Vec::new()),
        });

        let worker_shared = Arc::clone(&shared);
        let thread_name = format!("gpu-{}", vendor.name());
        let worker = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || poll_loop(worker_shared, vendor, interval))
            .map_err(|e| warn!("failed to spawn worker {}: {}", thread_name, e))
            .ok();

        Self {
            info,
            shared,
            worker,
        }
    }

    /// Registers interest in `pid`; its process snapshot appears after the
    /// next poll cycle and disappears when the process exits.
    pub fn register_pid(&self, pid: u32) {
        let mut pending = self
            .shared
            .pending_pids
            .lock()
            .expect("pending pids lock poisoned");
        pending.push(pid);
    }

    /// Copy of the current system snapshot.
    pub fn system_snapshot(&self) -> GpuSystemSnapshot {
        self.shared
            .snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .system
    }

    /// Copy of the current per-process snapshots.
    pub fn process_snapshots(&self) -> HashMap<u32, GpuProcessSnapshot> {
        self.shared
            .snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .processes
            .clone()
    }

    /// Both snapshot sides from the same poll cycle.
    pub fn snapshots(&self) -> DeviceSnapshots {
        self.shared
            .snapshots
            .lock()
            .expect("snapshot lock poisoned")
            .clone()
    }

    pub fn set_active(&self, active: bool) {
        self.shared.is_active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active.load(Ordering::Relaxed)
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn poll_loop(shared: Arc<DeviceShared>, mut vendor: Box<dyn VendorGpu>, interval: Duration) {
    let mut previous_time = Instant::now();
    let mut tracked: Vec<u32> = Vec::new();

    while !shared.stop.load(Ordering::Acquire) {
        trace!("poll()");

        let now = Instant::now();
        let delta = now.duration_since(previous_time);
        previous_time = now;

        // Adopt pids registered since the previous cycle
        let pending: Vec<u32> = {
            let mut pending = shared
                .pending_pids
                .lock()
                .expect("pending pids lock poisoned");
            std::mem::take(&mut *pending)
        };
        for pid in pending {
            if !tracked.contains(&pid) {
                vendor.register_pid(pid);
                tracked.push(pid);
            }
        }

        // Exited processes silently leave the tracked set
        tracked.retain(|pid| {
            let alive = Path::new("/proc").join(pid.to_string()).exists();
            if !alive {
                debug!("pid {} gone, dropping its process metrics", pid);
            }
            alive
        });

        vendor.pre_poll(delta);

        let system = GpuSystemSnapshot {
            load: vendor.load(),

            vram_used: vendor.vram_used(),
            gtt_used: vendor.gtt_used(),
            memory_total: vendor.memory_total(),
            memory_clock: vendor.memory_clock(),
            memory_temp: vendor.memory_temp(),

            temperature: vendor.temperature(),
            junction_temperature: vendor.junction_temperature(),

            core_clock: vendor.core_clock(),
            voltage: vendor.voltage(),

            power_usage: vendor.power_usage(),
            power_limit: vendor.power_limit(),

            is_apu: vendor.is_apu(),
            apu_cpu_power: vendor.apu_cpu_power(),
            apu_cpu_temp: vendor.apu_cpu_temp(),

            is_power_throttled: vendor.is_power_throttled(),
            is_current_throttled: vendor.is_current_throttled(),
            is_temp_throttled: vendor.is_temp_throttled(),
            is_other_throttled: vendor.is_other_throttled(),

            fan_speed: vendor.fan_speed(),
            fan_rpm: vendor.fan_rpm(),
        };

        let mut processes = HashMap::with_capacity(tracked.len());
        for &pid in &tracked {
            processes.insert(
                pid,
                GpuProcessSnapshot {
                    load: vendor.process_load(pid, delta),
                    vram_used: vendor.process_vram_used(pid),
                    gtt_used: vendor.process_gtt_used(pid),
                },
            );
        }

        // Both sides published in one critical section: readers never see
        // system and process data from different cycles
        {
            let mut snapshots = shared.snapshots.lock().expect("snapshot lock poisoned");
            snapshots.system = system;
            snapshots.processes = processes;
        }

        thread::sleep(interval);
    }
}
