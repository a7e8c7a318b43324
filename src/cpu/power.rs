//! CPU package power estimation backends.
//!
//! Three mutually exclusive kernel interfaces can provide package power;
//! exactly one is adopted at startup by probing in a fixed order:
//! zenpower (out-of-tree AMD module, instantaneous µW readings), zenergy
//! (out-of-tree AMD energy counter), then the in-tree RAPL powercap
//! counter. When none resolves, no power data is reported.

use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use crate::counter::DeltaCounter;
use crate::hwmon::{find_hwmon_dir_by_name, SensorSet, SensorSpec};

pub trait CpuPowerBackend: Send {
    fn poll(&mut self);
    fn power_usage(&mut self) -> f32;
}

/// Probes the backends in order and adopts the first one available.
pub fn init_power_backend(hwmon_root: &Path, rapl_dir: &Path) -> Option<Box<dyn CpuPowerBackend>> {
    if let Some(backend) = Zenpower::probe(hwmon_root) {
        info!("Using zenpower for cpu power");
        return Some(Box::new(backend));
    }

    if let Some(backend) = Zenergy::probe(hwmon_root) {
        info!("Using zenergy for cpu power");
        return Some(Box::new(backend));
    }

    if let Some(backend) = Rapl::probe(rapl_dir) {
        info!("Using RAPL for cpu power");
        return Some(Box::new(backend));
    }

    debug!("no cpu power interface found");
    None
}

const ZENPOWER_SENSORS: &[SensorSpec] = &[
    SensorSpec::new("core_power", "power1_input"),
    SensorSpec::new("soc_power", "power2_input"),
];

/// zenpower reports instantaneous µW per rail, no delta needed.
struct Zenpower {
    sensors: SensorSet,
}

impl Zenpower {
    fn probe(hwmon_root: &Path) -> Option<Self> {
        let dir = find_hwmon_dir_by_name(hwmon_root, "zenpower")?;

        let mut sensors = SensorSet::new();
        sensors.setup(&dir, ZENPOWER_SENSORS);

        for spec in ZENPOWER_SENSORS {
            if !sensors.is_open(spec.name) {
                debug!("failed to open {:?}", spec.name);
                return None;
            }
        }

        Some(Self { sensors })
    }
}

impl CpuPowerBackend for Zenpower {
    fn poll(&mut self) {
        self.sensors.poll();
    }

    fn power_usage(&mut self) -> f32 {
        let core_power = self.sensors.value("core_power");
        let soc_power = self.sensors.value("soc_power");
        (core_power + soc_power) as f32 / 1_000_000.0
    }
}

const ZENERGY_SENSORS: &[SensorSpec] = &[SensorSpec::new("energy", "energy1_input")];

/// zenergy exposes an accumulating µJ counter.
struct Zenergy {
    sensors: SensorSet,
    energy: DeltaCounter,
}

impl Zenergy {
    fn probe(hwmon_root: &Path) -> Option<Self> {
        let dir = find_hwmon_dir_by_name(hwmon_root, "zenergy")?;

        let mut sensors = SensorSet::new();
        sensors.setup(&dir, ZENERGY_SENSORS);

        if !sensors.is_open("energy") {
            debug!("failed to open zenergy energy reading");
            return None;
        }

        Some(Self {
            sensors,
            energy: DeltaCounter::new(),
        })
    }
}

impl CpuPowerBackend for Zenergy {
    fn poll(&mut self) {
        self.sensors.poll();
    }

    fn power_usage(&mut self) -> f32 {
        // µJ per second is µW
        let rate = self.energy.rate(self.sensors.value("energy"), Instant::now());
        (rate / 1_000_000.0) as f32
    }
}

const RAPL_SENSORS: &[SensorSpec] = &[SensorSpec::new("energy", "energy_uj")];

/// In-tree powercap RAPL µJ counter.
struct Rapl {
    sensors: SensorSet,
    energy: DeltaCounter,
}

impl Rapl {
    fn probe(rapl_dir: &Path) -> Option<Self> {
        let mut sensors = SensorSet::new();
        sensors.setup(rapl_dir, RAPL_SENSORS);

        if !sensors.is_open("energy") {
            debug!("failed to open {:?}", rapl_dir);
            return None;
        }

        Some(Self {
            sensors,
            energy: DeltaCounter::new(),
        })
    }
}

impl CpuPowerBackend for Rapl {
    fn poll(&mut self) {
        self.sensors.poll();
    }

    fn power_usage(&mut self) -> f32 {
        let rate = self.energy.rate(self.sensors.value("energy"), Instant::now());
        (rate / 1_000_000.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn hwmon_instance(root: &Path, index: u32, name: &str) -> std::path::PathBuf {
        let dir = root.join(format!("hwmon{}", index));
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("name"), format!("{}\n", name)).expect("write name");
        dir
    }

    #[test]
    fn test_fallback_order_prefers_zenpower() {
        let root = tempdir().expect("tempdir");
        let zp = hwmon_instance(root.path(), 0, "zenpower");
        fs::write(zp.join("power1_input"), "21000000\n").expect("write");
        fs::write(zp.join("power2_input"), "9000000\n").expect("write");
        let ze = hwmon_instance(root.path(), 1, "zenergy");
        fs::write(ze.join("energy1_input"), "1\n").expect("write");

        let mut backend =
            init_power_backend(root.path(), Path::new("/nonexistent/rapl")).expect("backend");
        backend.poll();
        assert!((backend.power_usage() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_zenpower_requires_both_rails() {
        let root = tempdir().expect("tempdir");
        let zp = hwmon_instance(root.path(), 0, "zenpower");
        fs::write(zp.join("power1_input"), "21000000\n").expect("write");
        // power2_input missing: zenpower must not be adopted

        assert!(init_power_backend(root.path(), Path::new("/nonexistent/rapl")).is_none());
    }

    #[test]
    fn test_rapl_energy_delta() {
        let root = tempdir().expect("tempdir");
        let rapl = root.path().join("intel-rapl:0");
        fs::create_dir_all(&rapl).expect("mkdir");
        fs::write(rapl.join("energy_uj"), "1000000\n").expect("write");

        let mut backend =
            init_power_backend(Path::new("/nonexistent/hwmon"), &rapl).expect("backend");

        backend.poll();
        assert_eq!(backend.power_usage(), 0.0); // first sample primes

        fs::write(rapl.join("energy_uj"), "3000000\n").expect("rewrite");
        std::thread::sleep(Duration::from_millis(40));
        backend.poll();
        // 2 J over ~40 ms is a large positive wattage
        assert!(backend.power_usage() > 1.0);
    }

    #[test]
    fn test_no_backend_available() {
        assert!(init_power_backend(Path::new("/nonexistent/a"), Path::new("/nonexistent/b")).is_none());
    }
}
