//! AMD GPU driver (amdgpu kernel module).
//!
//! Composes three data sources: the device's hwmon directory (temperatures,
//! clocks, power, fan), a handful of scalar sysfs files directly under the
//! device directory (busy percent, VRAM/GTT accounting), and the structured
//! `gpu_metrics` binary blob. The blob takes precedence for everything it
//! provides; the scalar sensors remain the fallback for firmware without it.

use ahash::AHashMap as HashMap;
use std::time::Duration;
use tracing::debug;

use crate::counter::{engine_load_percent, DeltaCounter};
use crate::fdinfo::FdinfoAccountant;
use crate::gpu::gpu_metrics::GpuMetricsDecoder;
use crate::gpu::{DeviceInfo, VendorGpu};
use crate::hwmon::{find_hwmon_dir, SensorSet, SensorSpec};

const HWMON_SENSORS: &[SensorSpec] = &[
    SensorSpec::new("temperature", "temp1_input"),
    SensorSpec::new("junction_temp", "temp2_input"),
    SensorSpec::new("memory_temp", "temp3_input"),
    SensorSpec::new("frequency", "freq1_input"),
    SensorSpec::new("memory_clock", "freq2_input"),
    SensorSpec::new("voltage", "in0_input"),
    SensorSpec::new("average_power", "power1_average"),
    SensorSpec::new("current_power", "power1_input"),
    SensorSpec::new("power_limit", "power1_cap"),
    SensorSpec::new("fan", "fan1_input"),
];

/// Scalar accounting files directly under `<node>/device`.
const SYSFS_SENSORS: &[SensorSpec] = &[
    SensorSpec::new("load", "gpu_busy_percent"),
    SensorSpec::new("vram_used", "mem_info_vram_used"),
    SensorSpec::new("gtt_used", "mem_info_gtt_used"),
    SensorSpec::new("vram_total", "mem_info_vram_total"),
];

// Van Gogh (Steam Deck) integrated parts report a bogus sclk through hwmon;
// the metrics blob is authoritative there.
const VANGOGH_DEVICE_IDS: &[u32] = &[0x1435, 0x163f];

pub struct AmdGpu {
    device_id: u32,
    hwmon: SensorSet,
    sysfs: SensorSet,
    fdinfo: FdinfoAccountant,
    metrics: GpuMetricsDecoder,
    metrics_available: bool,
    engine_time: HashMap<u32, DeltaCounter>,
}

impl AmdGpu {
    pub fn new(info: &DeviceInfo) -> Self {
        let mut hwmon = SensorSet::new();
        if let Some(dir) = find_hwmon_dir(&info.node_path) {
            hwmon.setup(&dir, HWMON_SENSORS);
        }

        let mut sysfs = SensorSet::new();
        sysfs.setup(&info.node_path.join("device"), SYSFS_SENSORS);

        let mut metrics = GpuMetricsDecoder::new();
        let metrics_available = match metrics.setup(&info.node_path.join("device/gpu_metrics")) {
            Ok(()) => true,
            Err(e) => {
                debug!("amdgpu: gpu_metrics unavailable: {}", e);
                false
            }
        };

        Self {
            device_id: info.device_id,
            hwmon,
            sysfs,
            fdinfo: FdinfoAccountant::new(&info.drm_node),
            metrics,
            metrics_available,
            engine_time: HashMap::new(),
        }
    }
}

impl VendorGpu for AmdGpu {
    fn name(&self) -> &'static str {
        "amdgpu"
    }

    fn pre_poll(&mut self, _delta: Duration) {
        self.hwmon.poll();
        self.sysfs.poll();
        self.fdinfo.poll_all();

        if self.metrics_available {
            self.metrics.poll();
        }
    }

    fn load(&mut self) -> i32 {
        if self.metrics_available {
            let load = self.metrics.metrics.load_percent;

            // some firmware reports activity as centipercent
            if load > 100 {
                return load / 100;
            }

            load
        } else {
            self.sysfs.value("load") as i32
        }
    }

    fn vram_used(&mut self) -> f32 {
        self.sysfs.value("vram_used") as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn gtt_used(&mut self) -> f32 {
        self.sysfs.value("gtt_used") as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn memory_total(&mut self) -> f32 {
        self.sysfs.value("vram_total") as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn memory_clock(&mut self) -> i32 {
        if self.metrics_available {
            self.metrics.metrics.memory_clock_mhz
        } else {
            (self.hwmon.value("memory_clock") as f32 / 1_000_000.0) as i32
        }
    }

    fn memory_temp(&mut self) -> i32 {
        (self.hwmon.value("memory_temp") as f32 / 1000.0).round() as i32
    }

    fn temperature(&mut self) -> i32 {
        if self.metrics_available {
            if self.metrics.is_apu() {
                self.metrics.metrics.cpu_temperature_c
            } else {
                self.metrics.metrics.temperature_c
            }
        } else {
            (self.hwmon.value("temperature") as f32 / 1000.0).round() as i32
        }
    }

    fn junction_temperature(&mut self) -> i32 {
        (self.hwmon.value("junction_temp") as f32 / 1000.0).round() as i32
    }

    fn core_clock(&mut self) -> i32 {
        if self.metrics_available && VANGOGH_DEVICE_IDS.contains(&self.device_id) {
            self.metrics.metrics.core_clock_mhz
        } else {
            (self.hwmon.value("frequency") as f32 / 1_000_000.0) as i32
        }
    }

    fn voltage(&mut self) -> i32 {
        self.hwmon.value("voltage") as i32
    }

    fn power_usage(&mut self) -> f32 {
        // -1 marks power as absent from the decoded blob
        if self.metrics_available && self.metrics.metrics.power_w != -1.0 {
            self.metrics.metrics.power_w
        } else if self.hwmon.is_open("average_power") {
            self.hwmon.value("average_power") as f32 / 1_000_000.0
        } else {
            self.hwmon.value("current_power") as f32 / 1_000_000.0
        }
    }

    fn power_limit(&mut self) -> f32 {
        self.hwmon.value("power_limit") as f32 / 1_000_000.0
    }

    fn is_apu(&mut self) -> bool {
        self.metrics_available && self.metrics.is_apu()
    }

    fn apu_cpu_power(&mut self) -> f32 {
        if self.metrics_available {
            self.metrics.metrics.cpu_power_w
        } else {
            0.0
        }
    }

    fn apu_cpu_temp(&mut self) -> i32 {
        if self.metrics_available {
            self.metrics.metrics.cpu_temperature_c
        } else {
            0
        }
    }

    fn is_power_throttled(&mut self) -> bool {
        self.metrics_available && self.metrics.metrics.is_power_throttled
    }

    fn is_current_throttled(&mut self) -> bool {
        self.metrics_available && self.metrics.metrics.is_current_throttled
    }

    fn is_temp_throttled(&mut self) -> bool {
        self.metrics_available && self.metrics.metrics.is_temp_throttled
    }

    fn is_other_throttled(&mut self) -> bool {
        self.metrics_available && self.metrics.metrics.is_other_throttled
    }

    fn fan_speed(&mut self) -> i32 {
        if self.metrics_available {
            self.metrics.metrics.fan_speed
        } else {
            self.hwmon.value("fan") as i32
        }
    }

    fn register_pid(&mut self, pid: u32) {
        self.fdinfo.add_pid(pid);
    }

    fn process_load(&mut self, pid: u32, delta: Duration) -> i32 {
        let engine_ns = self.fdinfo.engine_time_ns(pid, "drm-engine-gfx");
        let counter = self.engine_time.entry(pid).or_default();
        engine_load_percent(counter, engine_ns, delta)
    }

    fn process_vram_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-memory-vram")
    }

    fn process_gtt_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-memory-gtt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn fake_device(root: &std::path::Path) -> DeviceInfo {
        let node_path = root.join("renderD128");
        let hwmon = node_path.join("device/hwmon/hwmon2");
        fs::create_dir_all(&hwmon).expect("mkdir hwmon");

        fs::write(hwmon.join("temp1_input"), "61000\n").expect("write");
        fs::write(hwmon.join("freq1_input"), "2100000000\n").expect("write");
        fs::write(hwmon.join("power1_average"), "180000000\n").expect("write");
        fs::write(hwmon.join("power1_cap"), "250000000\n").expect("write");

        let device = node_path.join("device");
        fs::write(device.join("gpu_busy_percent"), "37\n").expect("write");
        fs::write(device.join("mem_info_vram_used"), "2147483648\n").expect("write");
        fs::write(device.join("mem_info_vram_total"), "8589934592\n").expect("write");

        DeviceInfo {
            drm_node: "renderD128".into(),
            node_path,
            pci_dev: "0000:03:00.0".into(),
            vendor_id: 0x1002,
            device_id: 0x731f,
            driver: "amdgpu".into(),
        }
    }

    #[test]
    fn test_sensor_fallback_without_metrics_blob() {
        let root = tempdir().expect("tempdir");
        let info = fake_device(root.path());

        let mut gpu = AmdGpu::new(&info);
        assert!(!gpu.metrics_available);

        gpu.pre_poll(Duration::from_secs(1));
        assert_eq!(gpu.load(), 37);
        assert_eq!(gpu.temperature(), 61);
        assert_eq!(gpu.core_clock(), 2100);
        assert!((gpu.power_usage() - 180.0).abs() < 1e-6);
        assert!((gpu.power_limit() - 250.0).abs() < 1e-6);
        assert!((gpu.vram_used() - 2.0).abs() < 1e-6);
        assert!((gpu.memory_total() - 8.0).abs() < 1e-6);
        assert!(!gpu.is_apu());
    }

    #[test]
    fn test_metrics_blob_preferred_and_centipercent_halved() {
        let root = tempdir().expect("tempdir");
        let info = fake_device(root.path());

        // v1_3 blob reporting centipercent load and socket power
        let mut blob = vec![0u8; 120];
        blob[2] = 1;
        blob[3] = 3;
        blob[16..18].copy_from_slice(&6700u16.to_le_bytes()); // average_gfx_activity
        blob[22..24].copy_from_slice(&42u16.to_le_bytes()); // average_socket_power
        fs::write(info.node_path.join("device/gpu_metrics"), &blob).expect("write blob");

        let mut gpu = AmdGpu::new(&info);
        assert!(gpu.metrics_available);

        gpu.pre_poll(Duration::from_secs(1));
        assert_eq!(gpu.load(), 67);
        assert!((gpu.power_usage() - 42.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_everything_reads_unavailable() {
        let info = DeviceInfo {
            drm_node: "renderD200".into(),
            node_path: PathBuf::from("/nonexistent/renderD200"),
            pci_dev: String::new(),
            vendor_id: 0x1002,
            device_id: 0,
            driver: "amdgpu".into(),
        };

        let mut gpu = AmdGpu::new(&info);
        gpu.pre_poll(Duration::from_secs(1));
        assert_eq!(gpu.load(), 0);
        assert_eq!(gpu.temperature(), 0);
        assert_eq!(gpu.power_usage(), 0.0);
        assert_eq!(gpu.process_load(1234, Duration::from_secs(1)), 0);
    }
}
