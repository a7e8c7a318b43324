//! Generic sensor discovery and polling over hwmon-style directories.
//!
//! The kernel hwmon convention exposes one scalar value per small text file
//! (`temp1_input`, `power1_average`, ...) with an optional sibling label
//! file (`temp1_label`) that disambiguates what the channel measures. A
//! [`SensorSet`] resolves a list of generic sensor names to concrete files
//! once at setup, keeps the files open, and re-reads them on every poll.
//!
//! Sensors that do not resolve, or whose file disappears later, are not
//! errors: they simply keep reading as 0 and callers treat 0 as
//! "unavailable" rather than a valid zero reading.

use ahash::AHashMap as HashMap;
use regex::Regex;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Declarative description of one sensor to look for.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// Generic name the caller uses to query the value ("temperature", ...).
    pub name: &'static str,
    /// Regex matched against candidate filenames in the base directory.
    pub filename: &'static str,
    /// Optional regex matched against the sibling `<id>_label` file content.
    pub label: Option<&'static str>,
}

impl SensorSpec {
    pub const fn new(name: &'static str, filename: &'static str) -> Self {
        Self {
            name,
            filename,
            label: None,
        }
    }

    pub const fn with_label(
        name: &'static str,
        filename: &'static str,
        label: &'static str,
    ) -> Self {
        Self {
            name,
            filename,
            label: Some(label),
        }
    }
}

struct Sensor {
    filename: Regex,
    label: Option<Regex>,
    path: Option<PathBuf>,
    file: Option<File>,
    value: u64,
}

/// A resolved set of sensors below one base directory.
///
/// Resolution happens exactly once per [`setup`](SensorSet::setup); a sensor
/// whose backing file vanishes afterwards stays at its last value.
#[derive(Default)]
pub struct SensorSet {
    sensors: HashMap<&'static str, Sensor>,
    base_dir: Option<PathBuf>,
}

impl SensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves and opens `specs` below `base_dir`. Clears any previous
    /// state. A missing base directory or unresolved sensors are non-fatal.
    pub fn setup(&mut self, base_dir: &Path, specs: &[SensorSpec]) {
        self.sensors.clear();
        self.base_dir = Some(base_dir.to_path_buf());

        for spec in specs {
            let filename = match full_match_regex(spec.filename) {
                Some(rx) => rx,
                None => continue,
            };
            let label = spec.label.and_then(full_match_regex);

            self.sensors.insert(
                spec.name,
                Sensor {
                    filename,
                    label,
                    path: None,
                    file: None,
                    value: 0,
                },
            );
        }

        self.find_sensors(base_dir);
        self.open_sensors();
    }

    fn find_sensors(&mut self, base_dir: &Path) {
        debug!("hwmon: checking {:?} directory", base_dir);

        let entries = match fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("hwmon: cannot read {:?}: {}", base_dir, e);
                return;
            }
        };

        for entry in entries.flatten() {
            if !entry.path().is_file() {
                continue;
            }

            let filename = entry.file_name().to_string_lossy().to_string();

            // all hwmon sensor files carry an underscore; the part before the
            // last one is the channel id used for the label lookup
            let underscore_pos = match filename.rfind('_') {
                Some(pos) => pos,
                None => continue,
            };

            for sensor in self.sensors.values_mut() {
                if sensor.path.is_some() {
                    continue;
                }

                if let Some(label_rx) = &sensor.label {
                    let label_file = format!("{}_label", &filename[..underscore_pos]);
                    let label = read_trimmed_line(&base_dir.join(label_file));
                    if !label_rx.is_match(&label) {
                        continue;
                    }
                }

                if !sensor.filename.is_match(&filename) {
                    continue;
                }

                sensor.path = Some(entry.path());
                break;
            }
        }
    }

    fn open_sensors(&mut self) {
        for (name, sensor) in self.sensors.iter_mut() {
            let path = match &sensor.path {
                Some(path) => path,
                None => {
                    debug!("hwmon: {} reading not found at {:?}", name, self.base_dir);
                    continue;
                }
            };

            debug!("hwmon: {} reading found at {:?}", name, path);

            match File::open(path) {
                Ok(file) => sensor.file = Some(file),
                Err(e) => debug!("hwmon: failed to open {} reading {:?}: {}", name, path, e),
            }
        }
    }

    /// Re-reads every open sensor. Empty reads and parse failures leave the
    /// previous value untouched.
    pub fn poll(&mut self) {
        for sensor in self.sensors.values_mut() {
            let file = match &mut sensor.file {
                Some(file) => file,
                None => continue,
            };

            let mut content = String::new();
            if file.seek(SeekFrom::Start(0)).is_err() {
                continue;
            }
            if file.read_to_string(&mut content).is_err() {
                continue;
            }

            let trimmed = content.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Ok(value) = trimmed.parse::<u64>() {
                sensor.value = value;
            }
        }
    }

    /// Last decoded value of `name`.
    ///
    /// Returns 0 both for an unknown/unresolved sensor and for a genuine zero
    /// reading; callers treat 0 as "unavailable".
    pub fn value(&self, name: &str) -> u64 {
        match self.sensors.get(name) {
            Some(sensor) => sensor.value,
            None => {
                debug!("hwmon: sensor {:?} doesn't exist", name);
                0
            }
        }
    }

    /// Whether `name` resolved to a file that was successfully opened.
    pub fn is_open(&self, name: &str) -> bool {
        self.sensors
            .get(name)
            .map(|s| s.file.is_some())
            .unwrap_or(false)
    }

    pub fn path(&self, name: &str) -> Option<&Path> {
        self.sensors.get(name).and_then(|s| s.path.as_deref())
    }
}

/// First hwmon instance directory below `<node>/device/hwmon`, if any.
pub fn find_hwmon_dir(drm_node_path: &Path) -> Option<PathBuf> {
    let hwmon_dir = drm_node_path.join("device/hwmon");

    if !hwmon_dir.exists() {
        debug!("hwmon: directory {:?} doesn't exist", hwmon_dir);
        return None;
    }

    let entry = fs::read_dir(&hwmon_dir).ok()?.flatten().next();

    match entry {
        Some(entry) => Some(entry.path()),
        None => {
            debug!("hwmon: directory {:?} is empty", hwmon_dir);
            None
        }
    }
}

/// First hwmon instance below `hwmon_root` whose `name` file matches the
/// given regex. Used to disambiguate multiple instances of the same kernel
/// module class (several power-reporting modules, thermal zones, ...).
pub fn find_hwmon_dir_by_name(hwmon_root: &Path, name: &str) -> Option<PathBuf> {
    if !hwmon_root.exists() {
        debug!("hwmon: root {:?} doesn't exist (custom kernel?)", hwmon_root);
        return None;
    }

    let name_rx = full_match_regex(name)?;

    let entries = fs::read_dir(hwmon_root).ok()?;

    for entry in entries.flatten() {
        let content = read_trimmed_line(&entry.path().join("name"));
        if content.is_empty() {
            continue;
        }

        if name_rx.is_match(&content) {
            // first instance with a matching name wins
            return Some(entry.path());
        }
    }

    debug!("hwmon: failed to find hwmon dir {:?}", name);
    None
}

/// Patterns match the whole candidate string, not a substring.
fn full_match_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("^(?:{})$", pattern)) {
        Ok(rx) => Some(rx),
        Err(e) => {
            debug!("hwmon: bad pattern {:?}: {}", pattern, e);
            None
        }
    }
}

fn read_trimmed_line(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.lines().next().unwrap_or("").trim().to_string())
        .unwrap_or_default()
}
