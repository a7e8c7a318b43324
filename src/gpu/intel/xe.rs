//! Intel Xe driver (Meteor Lake and later, discrete Arc parts).

use ahash::AHashMap as HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::counter::DeltaCounter;
use crate::fdinfo::FdinfoAccountant;
use crate::gpu::intel::drm::{MemoryRegionQuery, QueryKind};
use crate::gpu::intel::{open_logged, read_sysfs_int, ThrottleReasons, ThrottleStatus};
use crate::gpu::{DeviceInfo, VendorGpu};
use crate::hwmon::{find_hwmon_dir, SensorSet, SensorSpec};

const HWMON_SENSORS: &[SensorSpec] = &[
    SensorSpec::new("voltage", "in1_input"),
    // technically there are three fan channels; the first is enough
    SensorSpec::new("fan_speed", "fan1_input"),
    SensorSpec::new("temp", "temp2_input"),
    SensorSpec::new("vram_temp", "temp3_input"),
    SensorSpec::new("energy", "energy2_input"),
    SensorSpec::new("power_limit", "power2_max"),
];

pub struct IntelXe {
    hwmon: SensorSet,
    fdinfo: FdinfoAccountant,
    drm: MemoryRegionQuery,
    drm_available: bool,
    gpu_clock: Option<File>,
    throttle: Option<ThrottleReasons>,
    throttling: ThrottleStatus,
    energy: DeltaCounter,
    /// Per drm-client-id: previous (cycles, total_cycles) pair.
    previous_cycles: HashMap<String, (u64, u64)>,
}

impl IntelXe {
    pub fn new(info: &DeviceInfo) -> Self {
        let mut hwmon = SensorSet::new();
        if let Some(dir) = find_hwmon_dir(&info.node_path) {
            hwmon.setup(&dir, HWMON_SENSORS);
        }

        let mut drm = MemoryRegionQuery::new(QueryKind::Xe);
        let drm_available =
            drm.setup(&PathBuf::from(format!("/dev/dri/by-path/pci-{}-card", info.pci_dev)));

        let (gpu_clock, throttle) = match find_rcs_gt_dir(info) {
            Some(gt_dir) => (
                open_logged(&gt_dir.join("freq0/act_freq"), "GPU clock"),
                ThrottleReasons::open(&gt_dir.join("freq0/throttle"), "status", ""),
            ),
            None => (None, None),
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
            previous_cycles: HashMap::new(),
        }
    }
}

/// Finds the gt directory under `tile0` that carries the render engine.
fn find_rcs_gt_dir(info: &DeviceInfo) -> Option<PathBuf> {
    let tile = info.node_path.join("device/tile0");

    if !tile.exists() {
        warn!(
            "{:?} doesn't exist. GPU clock and throttling status will be unavailable",
            tile
        );
        return None;
    }

    let entries = fs::read_dir(&tile).ok()?;

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if !name.starts_with("gt") {
            continue;
        }

        debug!("checking {:?} for rcs", path);

        if !path.join("engines/rcs").exists() {
            debug!("skipping {:?} because rcs doesn't exist", path);
            continue;
        }

        debug!("found rcs in {:?}", path);
        return Some(path);
    }

    warn!("rcs not found inside {:?}. GPU clock will not be available", tile);
    None
}

impl VendorGpu for IntelXe {
    fn name(&self) -> &'static str {
        "intel-xe"
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

    fn memory_temp(&mut self) -> i32 {
        (self.hwmon.value("vram_temp") as f32 / 1000.0).round() as i32
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

    /// Sum of per-context duty cycles: each context reports busy cycles and
    /// total cycles, load is the sum of the per-interval ratios.
    fn process_load(&mut self, pid: u32, _delta: Duration) -> i32 {
        let handles = match self.fdinfo.get(pid) {
            Some(handles) => handles,
            None => return 0,
        };

        duty_cycle_load(&mut self.previous_cycles, handles.handle_blocks())
    }

    fn process_vram_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-resident-vram0")
    }

    fn process_gtt_used(&mut self, pid: u32) -> f32 {
        self.fdinfo.memory_used_gib(pid, "drm-resident-gtt")
    }
}

/// Per-context duty-cycle aggregation over one poll interval.
///
/// A context seen for the first time only primes its baseline; contexts
/// whose counters did not advance contribute nothing.
fn duty_cycle_load<'a>(
    previous_cycles: &mut HashMap<String, (u64, u64)>,
    blocks: impl Iterator<Item = &'a HashMap<String, String>>,
) -> i32 {
    let mut load = 0.0f64;

    for block in blocks {
        let client_id = block.get("drm-client-id");
        let cycles = block.get("drm-cycles-rcs").and_then(|v| v.parse::<u64>().ok());
        let total_cycles = block
            .get("drm-total-cycles-rcs")
            .and_then(|v| v.parse::<u64>().ok());

        let (client_id, cycles, total_cycles) = match (client_id, cycles, total_cycles) {
            (Some(id), Some(c), Some(t)) => (id, c, t),
            _ => continue,
        };

        let (prev_cycles, prev_total) = match previous_cycles.get(client_id) {
            Some(&prev) => prev,
            None => {
                previous_cycles.insert(client_id.clone(), (cycles, total_cycles));
                continue;
            }
        };

        previous_cycles.insert(client_id.clone(), (cycles, total_cycles));

        if cycles <= prev_cycles || total_cycles <= prev_total {
            continue;
        }

        let delta_cycles = cycles - prev_cycles;
        let delta_total = total_cycles - prev_total;
        load += delta_cycles as f64 / delta_total as f64 * 100.0;
    }

    load.clamp(0.0, 100.0).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_xe_node(root: &std::path::Path) -> DeviceInfo {
        let node_path = root.join("renderD129");

        let hwmon = node_path.join("device/hwmon/hwmon5");
        fs::create_dir_all(&hwmon).expect("mkdir");
        fs::write(hwmon.join("temp2_input"), "48000\n").expect("write");
        fs::write(hwmon.join("temp3_input"), "56500\n").expect("write");

        // gt1 without rcs, gt0 with it: discovery must pick gt0
        let gt1 = node_path.join("device/tile0/gt1");
        fs::create_dir_all(&gt1).expect("mkdir");
        let gt0 = node_path.join("device/tile0/gt0");
        fs::create_dir_all(gt0.join("engines/rcs")).expect("mkdir");
        fs::create_dir_all(gt0.join("freq0/throttle")).expect("mkdir");
        fs::write(gt0.join("freq0/act_freq"), "2050\n").expect("write");
        fs::write(gt0.join("freq0/throttle/status"), "0\n").expect("write");

        DeviceInfo {
            drm_node: "renderD129".into(),
            node_path,
            pci_dev: "0000:03:00.0".into(),
            vendor_id: 0x8086,
            device_id: 0x56a0,
            driver: "xe".into(),
        }
    }

    #[test]
    fn test_gt_discovery_requires_rcs() {
        let root = tempdir().expect("tempdir");
        let info = fake_xe_node(root.path());

        let mut gpu = IntelXe::new(&info);
        gpu.pre_poll(Duration::from_secs(1));

        assert_eq!(gpu.core_clock(), 2050);
        assert_eq!(gpu.temperature(), 48);
        assert_eq!(gpu.memory_temp(), 57);
        assert!(!gpu.is_power_throttled());
    }

    fn context_block(id: &str, cycles: u64, total: u64) -> HashMap<String, String> {
        let mut block = HashMap::new();
        block.insert("drm-client-id".to_string(), id.to_string());
        block.insert("drm-cycles-rcs".to_string(), cycles.to_string());
        block.insert("drm-total-cycles-rcs".to_string(), total.to_string());
        block
    }

    #[test]
    fn test_duty_cycle_first_sample_primes_only() {
        let mut previous = HashMap::new();
        let blocks = [context_block("1", 1000, 10000)];
        assert_eq!(duty_cycle_load(&mut previous, blocks.iter()), 0);
        assert_eq!(previous["1"], (1000, 10000));
    }

    #[test]
    fn test_duty_cycle_sums_contexts() {
        let mut previous = HashMap::new();
        previous.insert("1".to_string(), (1000u64, 10000u64));
        previous.insert("2".to_string(), (2000u64, 10000u64));

        // context 1: 250/1000 = 25%, context 2: 300/1000 = 30%
        let blocks = [
            context_block("1", 1250, 11000),
            context_block("2", 2300, 11000),
        ];
        assert_eq!(duty_cycle_load(&mut previous, blocks.iter()), 55);
    }

    #[test]
    fn test_duty_cycle_clamps_at_100() {
        let mut previous = HashMap::new();
        previous.insert("1".to_string(), (0u64, 1000u64));
        previous.insert("2".to_string(), (0u64, 1000u64));

        let blocks = [
            context_block("1", 900, 2000),
            context_block("2", 950, 2000),
        ];
        assert_eq!(duty_cycle_load(&mut previous, blocks.iter()), 100);
    }

    #[test]
    fn test_duty_cycle_stalled_context_contributes_nothing() {
        let mut previous = HashMap::new();
        previous.insert("1".to_string(), (500u64, 1000u64));

        let blocks = [context_block("1", 500, 1000)];
        assert_eq!(duty_cycle_load(&mut previous, blocks.iter()), 0);
    }
}
