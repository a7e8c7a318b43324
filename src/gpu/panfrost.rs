//! ARM Mali driver (panfrost kernel module).
//!
//! Mali boards expose almost nothing device-wide: temperature comes from a
//! `gpu_thermal` hwmon instance, and the current clock is only published
//! per-handle through fdinfo (it is identical across processes, so the
//! first tracked handle serves). Per-process load sums the two engine
//! classes the hardware schedules independently.

use ahash::AHashMap as HashMap;
use std::path::Path;
use std::time::Duration;

use crate::counter::{engine_load_percent, DeltaCounter};
use crate::fdinfo::FdinfoAccountant;
use crate::gpu::{DeviceInfo, VendorGpu};
use crate::hwmon::{find_hwmon_dir_by_name, SensorSet, SensorSpec};

const SENSORS: &[SensorSpec] = &[SensorSpec::new("temp", "temp1_input")];

const HWMON_ROOT: &str = "/sys/class/hwmon";

pub struct Panfrost {
    hwmon: SensorSet,
    fdinfo: FdinfoAccountant,
    engine_time: HashMap<u32, DeltaCounter>,
}

impl Panfrost {
    pub fn new(info: &DeviceInfo) -> Self {
        Self::with_hwmon_root(info, Path::new(HWMON_ROOT))
    }

    pub fn with_hwmon_root(info: &DeviceInfo, hwmon_root: &Path) -> Self {
        let mut hwmon = SensorSet::new();
        if let Some(dir) = find_hwmon_dir_by_name(hwmon_root, "gpu_thermal") {
            hwmon.setup(&dir, SENSORS);
        }

        Self {
            hwmon,
            fdinfo: FdinfoAccountant::new(&info.drm_node),
            engine_time: HashMap::new(),
        }
    }
}

impl VendorGpu for Panfrost {
    fn name(&self) -> &'static str {
        "panfrost"
    }

    fn pre_poll(&mut self, _delta: Duration) {
        self.hwmon.poll();
        self.fdinfo.poll_all();
    }

    fn temperature(&mut self) -> i32 {
        (self.hwmon.value("temp") as f32 / 1000.0).round() as i32
    }

    fn core_clock(&mut self) -> i32 {
        // frequency is the same across all processes; read it from whichever
        // tracked process has a handle
        let process = match self.fdinfo.any_process() {
            Some(process) => process,
            None => return 0,
        };

        let freq_hz: u64 = match process
            .first_value("drm-curfreq-fragment")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse().ok())
        {
            Some(freq) => freq,
            None => return 0,
        };

        (freq_hz as f32 / 1_000_000.0).round() as i32
    }

    fn register_pid(&mut self, pid: u32) {
        self.fdinfo.add_pid(pid);
    }

    /// Fragment and vertex/tiler engines run concurrently; the process's
    /// busy time is their sum.
    fn process_load(&mut self, pid: u32, delta: Duration) -> i32 {
        let fragment_ns = self.fdinfo.engine_time_ns(pid, "drm-engine-fragment");
        let vertex_ns = self.fdinfo.engine_time_ns(pid, "drm-engine-vertex-tiler");

        let counter = self.engine_time.entry(pid).or_default();
        engine_load_percent(counter, fragment_ns + vertex_ns, delta)
    }

    fn process_vram_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-resident-memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn info() -> DeviceInfo {
        DeviceInfo {
            drm_node: "renderD128".into(),
            node_path: PathBuf::from("/nonexistent"),
            pci_dev: String::new(),
            vendor_id: 0,
            device_id: 0,
            driver: "panfrost".into(),
        }
    }

    #[test]
    fn test_temperature_from_named_thermal_zone() {
        let root = tempdir().expect("tempdir");
        let hwmon1 = root.path().join("hwmon1");
        fs::create_dir(&hwmon1).expect("mkdir");
        fs::write(hwmon1.join("name"), "gpu_thermal\n").expect("write");
        fs::write(hwmon1.join("temp1_input"), "51499\n").expect("write");

        let mut gpu = Panfrost::with_hwmon_root(&info(), root.path());
        gpu.pre_poll(Duration::from_secs(1));
        assert_eq!(gpu.temperature(), 51);
    }

    #[test]
    fn test_core_clock_unavailable_without_handles() {
        let mut gpu = Panfrost::with_hwmon_root(&info(), Path::new("/nonexistent/hwmon"));
        assert_eq!(gpu.core_clock(), 0);
    }
}
