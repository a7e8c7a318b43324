//! Qualcomm GPU drivers.
//!
//! Two distinct kernel paths exist on MSM platforms: the KGSL interface
//! (`/sys/class/kgsl/kgsl-3d0`) exposes load, temperature and clock as
//! plain scalar files, while the drm-based display driver only offers a
//! thermal hwmon instance plus fdinfo engine accounting.

use ahash::AHashMap as HashMap;
use std::path::Path;
use std::time::Duration;

use crate::counter::{engine_load_percent, DeltaCounter};
use crate::fdinfo::FdinfoAccountant;
use crate::gpu::{DeviceInfo, VendorGpu};
use crate::hwmon::{find_hwmon_dir_by_name, SensorSet, SensorSpec};

const KGSL_SENSORS: &[SensorSpec] = &[
    SensorSpec::new("load", "gpu_busy_percentage"),
    SensorSpec::new("temp", "temp"),
    SensorSpec::new("core_clock", "clock_mhz"),
];

const DPU_SENSORS: &[SensorSpec] = &[SensorSpec::new("temp", "temp1_input")];

const KGSL_DIR: &str = "/sys/class/kgsl/kgsl-3d0";
const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Adreno GPU through the KGSL sysfs interface.
pub struct MsmKgsl {
    sensors: SensorSet,
}

impl MsmKgsl {
    pub fn new(_info: &DeviceInfo) -> Self {
        Self::with_kgsl_dir(Path::new(KGSL_DIR))
    }

    pub fn with_kgsl_dir(dir: &Path) -> Self {
        let mut sensors = SensorSet::new();
        sensors.setup(dir, KGSL_SENSORS);
        Self { sensors }
    }
}

impl VendorGpu for MsmKgsl {
    fn name(&self) -> &'static str {
        "msm-kgsl"
    }

    fn pre_poll(&mut self, _delta: Duration) {
        self.sensors.poll();
    }

    fn load(&mut self) -> i32 {
        self.sensors.value("load") as i32
    }

    fn temperature(&mut self) -> i32 {
        (self.sensors.value("temp") as f32 / 1000.0).round() as i32
    }

    fn core_clock(&mut self) -> i32 {
        self.sensors.value("core_clock") as i32
    }
}

/// MSM display-processing unit through drm + hwmon.
pub struct MsmDpu {
    hwmon: SensorSet,
    fdinfo: FdinfoAccountant,
    engine_time: HashMap<u32, DeltaCounter>,
}

impl MsmDpu {
    pub fn new(info: &DeviceInfo) -> Self {
        Self::with_hwmon_root(info, Path::new(HWMON_ROOT))
    }

    pub fn with_hwmon_root(info: &DeviceInfo, hwmon_root: &Path) -> Self {
        let mut hwmon = SensorSet::new();
        if let Some(dir) = find_hwmon_dir_by_name(hwmon_root, "gpu") {
            hwmon.setup(&dir, DPU_SENSORS);
        }

        Self {
            hwmon,
            fdinfo: FdinfoAccountant::new(&info.drm_node),
            engine_time: HashMap::new(),
        }
    }
}

impl VendorGpu for MsmDpu {
    fn name(&self) -> &'static str {
        "msm-dpu"
    }

    fn pre_poll(&mut self, _delta: Duration) {
        self.hwmon.poll();
        self.fdinfo.poll_all();
    }

    fn temperature(&mut self) -> i32 {
        (self.hwmon.value("temp") as f32 / 1000.0).round() as i32
    }

    fn register_pid(&mut self, pid: u32) {
        self.fdinfo.add_pid(pid);
    }

    fn process_load(&mut self, pid: u32, delta: Duration) -> i32 {
        let engine_ns = self.fdinfo.engine_time_ns(pid, "drm-engine-gpu");
        let counter = self.engine_time.entry(pid).or_default();
        engine_load_percent(counter, engine_ns, delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_kgsl_scalar_sensors() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("gpu_busy_percentage"), "41\n").expect("write");
        fs::write(dir.path().join("temp"), "38000\n").expect("write");
        fs::write(dir.path().join("clock_mhz"), "587\n").expect("write");

        let mut gpu = MsmKgsl::with_kgsl_dir(dir.path());
        gpu.pre_poll(Duration::from_secs(1));

        assert_eq!(gpu.load(), 41);
        assert_eq!(gpu.temperature(), 38);
        assert_eq!(gpu.core_clock(), 587);
    }

    #[test]
    fn test_kgsl_missing_interface_reads_unavailable() {
        let mut gpu = MsmKgsl::with_kgsl_dir(Path::new("/nonexistent/kgsl-3d0"));
        gpu.pre_poll(Duration::from_secs(1));
        assert_eq!(gpu.load(), 0);
        assert_eq!(gpu.core_clock(), 0);
    }

    #[test]
    fn test_dpu_hwmon_found_by_name() {
        let root = tempdir().expect("tempdir");
        let hwmon0 = root.path().join("hwmon0");
        fs::create_dir(&hwmon0).expect("mkdir");
        fs::write(hwmon0.join("name"), "gpu\n").expect("write");
        fs::write(hwmon0.join("temp1_input"), "44000\n").expect("write");

        let info = DeviceInfo {
            drm_node: "renderD128".into(),
            node_path: PathBuf::from("/nonexistent"),
            pci_dev: String::new(),
            vendor_id: 0,
            device_id: 0,
            driver: "msm_dpu".into(),
        };

        let mut gpu = MsmDpu::with_hwmon_root(&info, root.path());
        gpu.pre_poll(Duration::from_secs(1));
        assert_eq!(gpu.temperature(), 44);
    }
}
