//! Intel i915 driver (gen9 through early discrete parts).

use ahash::AHashMap as HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::counter::{engine_load_percent, DeltaCounter};
use crate::fdinfo::FdinfoAccountant;
use crate::gpu::intel::drm::{MemoryRegionQuery, QueryKind};
use crate::gpu::intel::{find_card_dir, open_logged, read_sysfs_int, ThrottleReasons, ThrottleStatus};
use crate::gpu::{DeviceInfo, VendorGpu};
use crate::hwmon::{find_hwmon_dir, SensorSet, SensorSpec};

const HWMON_SENSORS: &[SensorSpec] = &[
    SensorSpec::new("voltage", "in0_input"),
    SensorSpec::new("fan_speed", "fan1_input"),
    SensorSpec::new("temp", "temp1_input"),
    SensorSpec::new("energy", "energy1_input"),
    SensorSpec::new("power_limit", "power1_max"),
];

pub struct IntelI915 {
    hwmon: SensorSet,
    fdinfo: FdinfoAccountant,
    drm: MemoryRegionQuery,
    drm_available: bool,
    gpu_clock: Option<File>,
    throttle: Option<ThrottleReasons>,
    throttling: ThrottleStatus,
    energy: DeltaCounter,
    engine_time: HashMap<u32, DeltaCounter>,
}

impl IntelI915 {
    pub fn new(info: &DeviceInfo) -> Self {
        let mut hwmon = SensorSet::new();
        if let Some(dir) = find_hwmon_dir(&info.node_path) {
            hwmon.setup(&dir, HWMON_SENSORS);
        }

        let mut drm = MemoryRegionQuery::new(QueryKind::I915);
        let drm_available =
            drm.setup(&PathBuf::from(format!("/dev/dri/by-path/pci-{}-card", info.pci_dev)));

        let (gpu_clock, throttle) = match find_card_dir(&info.node_path) {
            Some(card_dir) => {
                let clock = open_logged(&card_dir.join("gt_act_freq_mhz"), "GPU clock");
                // all supported parts keep the render engine on gt0
                let throttle =
                    ThrottleReasons::open(&card_dir.join("gt/gt0"), "reason_status", "throttle_");
                (clock, throttle)
            }
            None => {
                warn!("failed to find gt dir. gpu clock and throttling status will not work");
                (None, None)
            }
        };

        Self {
            hwmon,
            fdinfo: FdinfoAccountant::new(&info.drm_node),
            drm,
            drm_available,
            gpu_clock,
            throttle,
            throttling: ThrottleStatus::default(),
            energy: DeltaCounter::new(),
            engine_time: HashMap::new(),
        }
    }
}

impl VendorGpu for IntelI915 {
    fn name(&self) -> &'static str {
        "intel-i915"
    }

    fn pre_poll(&mut self, _delta: Duration) {
        self.hwmon.poll();
        self.fdinfo.poll_all();
        self.drm.poll();
        self.throttling = match &mut self.throttle {
            Some(throttle) => throttle.poll(),
            None => ThrottleStatus::default(),
        };
    }

    fn vram_used(&mut self) -> f32 {
        if !self.drm_available {
            return 0.0;
        }

        self.drm.used_memory() as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn memory_total(&mut self) -> f32 {
        if !self.drm_available {
            return 0.0;
        }

        self.drm.total_memory() as f32 / 1024.0 / 1024.0 / 1024.0
    }

    fn temperature(&mut self) -> i32 {
        (self.hwmon.value("temp") as f32 / 1000.0).round() as i32
    }

    fn core_clock(&mut self) -> i32 {
        read_sysfs_int(&mut self.gpu_clock)
    }

    fn voltage(&mut self) -> i32 {
        self.hwmon.value("voltage") as i32
    }

    fn power_usage(&mut self) -> f32 {
        // energy counter is µJ; its per-second rate is µW
        let rate = self.energy.rate(self.hwmon.value("energy"), Instant::now());
        (rate / 1_000_000.0) as f32
    }

    fn power_limit(&mut self) -> f32 {
        self.hwmon.value("power_limit") as f32 / 1_000_000.0
    }

    fn is_power_throttled(&mut self) -> bool {
        self.throttling.power
    }

    fn is_current_throttled(&mut self) -> bool {
        self.throttling.current
    }

    fn is_temp_throttled(&mut self) -> bool {
        self.throttling.temp
    }

    fn is_other_throttled(&mut self) -> bool {
        self.throttling.other
    }

    fn fan_speed(&mut self) -> i32 {
        self.hwmon.value("fan_speed") as i32
    }

    fn register_pid(&mut self, pid: u32) {
        self.fdinfo.add_pid(pid);
    }

    fn process_load(&mut self, pid: u32, delta: Duration) -> i32 {
        let engine_ns = self.fdinfo.engine_time_ns(pid, "drm-engine-render");
        let counter = self.engine_time.entry(pid).or_default();
        engine_load_percent(counter, engine_ns, delta)
    }

    fn process_vram_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-total-local0")
    }

    fn process_gtt_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-total-system0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_core_clock_and_temperature_from_fixture() {
        let root = tempdir().expect("tempdir");
        let node_path = root.path().join("renderD128");

        let hwmon = node_path.join("device/hwmon/hwmon4");
        fs::create_dir_all(&hwmon).expect("mkdir");
        fs::write(hwmon.join("temp1_input"), "52000\n").expect("write");
        fs::write(hwmon.join("power1_max"), "15000000\n").expect("write");

        let card = node_path.join("device/drm/card0");
        fs::create_dir_all(&card).expect("mkdir");
        fs::write(card.join("gt_act_freq_mhz"), "1150\n").expect("write");

        let info = DeviceInfo {
            drm_node: "renderD128".into(),
            node_path,
            pci_dev: "0000:00:02.0".into(),
            vendor_id: 0x8086,
            device_id: 0x9a49,
            driver: "i915".into(),
        };

        let mut gpu = IntelI915::new(&info);
        gpu.pre_poll(Duration::from_secs(1));

        assert_eq!(gpu.temperature(), 52);
        assert_eq!(gpu.core_clock(), 1150);
        assert!((gpu.power_limit() - 15.0).abs() < 1e-6);
        // no card node in the fixture: memory stays unavailable
        assert_eq!(gpu.vram_used(), 0.0);
        assert_eq!(gpu.memory_total(), 0.0);
    }

    #[test]
    fn test_energy_delta_power() {
        let root = tempdir().expect("tempdir");
        let node_path = root.path().join("renderD128");
        let hwmon = node_path.join("device/hwmon/hwmon4");
        fs::create_dir_all(&hwmon).expect("mkdir");
        fs::write(hwmon.join("energy1_input"), "1000000\n").expect("write");

        let info = DeviceInfo {
            drm_node: "renderD128".into(),
            node_path,
            pci_dev: "0000:00:02.0".into(),
            vendor_id: 0x8086,
            device_id: 0x9a49,
            driver: "i915".into(),
        };

        let mut gpu = IntelI915::new(&info);
        gpu.pre_poll(Duration::from_secs(1));

        // first sample primes the counter
        assert_eq!(gpu.power_usage(), 0.0);

        // a second poll with a larger counter yields a positive wattage
        fs::write(
            gpu.hwmon.path("energy").expect("energy path"),
            "9000000\n",
        )
        .expect("rewrite");
        std::thread::sleep(Duration::from_millis(50));
        gpu.pre_poll(Duration::from_millis(50));
        assert!(gpu.power_usage() > 0.0);
    }
}
