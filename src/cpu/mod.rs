//! CPU load, frequency, temperature and power collection.
//!
//! Unlike the GPU side this collector has no thread of its own: the owner
//! polls it synchronously on whatever cadence drives the overall update.
//! Load comes from per-line idle/total deltas over the whole-machine
//! counter file, frequency from the per-core info file (the reported
//! aggregate is the maximum across cores), temperature from a fixed probe
//! table of known sensor modules, and power from the backend chain in
//! [`power`].

pub mod power;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{info, warn};

use crate::hwmon::{find_hwmon_dir_by_name, SensorSet, SensorSpec};
use crate::snapshot::{CpuCoreInfo, CpuInfo};
use power::{init_power_backend, CpuPowerBackend};

const PROC_STAT: &str = "/proc/stat";
const PROC_CPUINFO: &str = "/proc/cpuinfo";
const HWMON_ROOT: &str = "/sys/class/hwmon";
const RAPL_DIR: &str = "/sys/class/powercap/intel-rapl:0";

/// Known CPU temperature sources, probed in order at startup. The first
/// module whose sensor resolves is adopted for the session.
struct TempProbe {
    module: &'static str,
    sensor: SensorSpec,
}

const TEMP_PROBES: &[TempProbe] = &[
    TempProbe {
        module: "coretemp",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "Package id 0"),
    },
    TempProbe {
        module: "zenpower",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "T(die|ctl)"),
    },
    TempProbe {
        module: "k10temp",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "T(die|ctl)"),
    },
    TempProbe {
        module: "atk0110",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "CPU Temperature"),
    },
    TempProbe {
        module: "it8603",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "temp1"),
    },
    TempProbe {
        module: "cpuss0_.*",
        sensor: SensorSpec::new("temperature", "temp1_input"),
    },
    TempProbe {
        module: "nct.*",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "TSI0_TEMP"),
    },
    TempProbe {
        module: "asusec",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "CPU"),
    },
    TempProbe {
        module: "l_pcs",
        sensor: SensorSpec::with_label("temperature", r"temp\d*_input", "Node 0 Max"),
    },
    TempProbe {
        module: r"cpu\d*_thermal",
        sensor: SensorSpec::new("temperature", "temp1_input"),
    },
];

/// CPU package temperature through the adopted probe-table sensor.
struct CpuTempSensor {
    sensors: SensorSet,
    found: bool,
}

impl CpuTempSensor {
    fn probe(hwmon_root: &Path) -> Self {
        for probe in TEMP_PROBES {
            let dir = match find_hwmon_dir_by_name(hwmon_root, probe.module) {
                Some(dir) => dir,
                None => continue,
            };

            let mut sensors = SensorSet::new();
            sensors.setup(&dir, std::slice::from_ref(&probe.sensor));

            if sensors.is_open("temperature") {
                info!(
                    "Using {} ({:?}) for cpu temperature",
                    probe.module,
                    sensors.path("temperature")
                );
                return Self {
                    sensors,
                    found: true,
                };
            }
        }

        Self {
            sensors: SensorSet::new(),
            found: false,
        }
    }

    fn temperature(&mut self) -> i32 {
        if !self.found {
            return 0;
        }

        self.sensors.poll();
        (self.sensors.value("temperature") as f32 / 1000.0).round() as i32
    }
}

/// Synchronously polled CPU metrics collector.
pub struct CpuCollector {
    stat: Option<File>,
    cpuinfo: Option<File>,
    prev_idle_times: Vec<u64>,
    prev_total_times: Vec<u64>,
    power: Option<Box<dyn CpuPowerBackend>>,
    temperature: CpuTempSensor,
    info: CpuInfo,
    cores: Vec<CpuCoreInfo>,
}

impl CpuCollector {
    pub fn new() -> Self {
        Self::with_paths(
            Path::new(PROC_STAT),
            Path::new(PROC_CPUINFO),
            Path::new(HWMON_ROOT),
            Path::new(RAPL_DIR),
        )
    }

    pub fn with_paths(stat: &Path, cpuinfo: &Path, hwmon_root: &Path, rapl_dir: &Path) -> Self {
        let stat = match File::open(stat) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("failed to open cpu stats file: {}. cpu load will not work", e);
                None
            }
        };

        let cpuinfo = match File::open(cpuinfo) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("failed to open cpu info file: {}. cpu frequency will not work", e);
                None
            }
        };

        Self {
            stat,
            cpuinfo,
            prev_idle_times: Vec::new(),
            prev_total_times: Vec::new(),
            power: init_power_backend(hwmon_root, rapl_dir),
            temperature: CpuTempSensor::probe(hwmon_root),
            info: CpuInfo::default(),
            cores: Vec::new(),
        }
    }

    /// One synchronous sampling cycle.
    pub fn poll(&mut self) {
        self.poll_load();
        self.poll_frequency();
        self.poll_power();
        self.info.temperature = self.temperature.temperature();
    }

    pub fn info(&self) -> CpuInfo {
        self.info
    }

    pub fn cores(&self) -> &[CpuCoreInfo] {
        &self.cores
    }

    /// Per-line (idle, total) pairs from the counter file; index 0 is the
    /// whole-machine aggregate.
    fn read_cpu_times(&mut self) -> Vec<(u64, u64)> {
        let file = match &mut self.stat {
            Some(file) => file,
            None => return Vec::new(),
        };

        if file.seek(SeekFrom::Start(0)).is_err() {
            return Vec::new();
        }

        let mut content = String::new();
        if file.read_to_string(&mut content).is_err() {
            return Vec::new();
        }

        let mut times = Vec::new();

        for line in content.lines() {
            if !line.starts_with("cpu") {
                continue;
            }

            let fields: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .filter_map(|v| v.parse().ok())
                .collect();

            // field 4 is idle time
            if fields.len() < 4 {
                continue;
            }

            let idle = fields[3];
            let total = fields.iter().sum();
            times.push((idle, total));
        }

        times
    }

    fn poll_load(&mut self) {
        let times = self.read_cpu_times();

        for (i, (idle, total)) in times.into_iter().enumerate() {
            if i > 0 && self.cores.len() <= i - 1 {
                self.cores.push(CpuCoreInfo::default());
            }

            // first sample per line only primes the baseline
            if self.prev_idle_times.len() <= i {
                self.prev_idle_times.push(idle);
                self.prev_total_times.push(total);
                continue;
            }

            let idle_delta = idle.saturating_sub(self.prev_idle_times[i]);
            let total_delta = total.saturating_sub(self.prev_total_times[i]);

            self.prev_idle_times[i] = idle;
            self.prev_total_times[i] = total;

            if total_delta == 0 {
                continue;
            }

            let utilization = 100.0 * (1.0 - idle_delta as f64 / total_delta as f64);
            let load = utilization.clamp(0.0, 100.0).round() as i32;

            if i == 0 {
                self.info.load = load;
            } else {
                self.cores[i - 1].load = load;
            }
        }
    }

    fn poll_frequency(&mut self) {
        let file = match &mut self.cpuinfo {
            Some(file) => file,
            None => return,
        };

        if file.seek(SeekFrom::Start(0)).is_err() {
            return;
        }

        let mut content = String::new();
        if file.read_to_string(&mut content).is_err() {
            return;
        }

        let mut cur_core = 0;

        for line in content.lines() {
            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };

            if key != "cpu MHz" {
                continue;
            }

            if self.cores.len() <= cur_core {
                self.cores.push(CpuCoreInfo::default());
            }

            if let Ok(mhz) = value.parse::<f32>() {
                self.cores[cur_core].frequency = mhz.round() as i32;
            }
            cur_core += 1;
        }

        // the package frequency is the fastest core's frequency
        self.info.frequency = self
            .cores
            .iter()
            .map(|core| core.frequency)
            .max()
            .unwrap_or(0);
    }

    fn poll_power(&mut self) {
        if let Some(power) = &mut self.power {
            power.poll();
            self.info.power = power.power_usage();
        }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}
