//! Decoder for the amdgpu `gpu_metrics` binary telemetry file.
//!
//! The file is a fixed-layout C struct snapshot, versioned by a
//! `(format_revision, content_revision)` pair in a common 4-byte header.
//! Format revision 1 covers desktop GPUs (layout v1_3 for content 1-3),
//! format revision 2 covers APUs (layouts v2_1 through v2_4). Any other
//! combination is rejected at setup.
//!
//! Individual fields inside a layout may be absent: a reserved sentinel
//! (`0xFFFF` for 16-bit fields) marks "not provided by this firmware".
//! Each target value therefore consults an ordered list of candidate
//! fields, falling back to array reductions (max of per-core temperatures,
//! sum of per-core powers) when the primary scalar is absent.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Header shared by all layouts: structure size, format and content revision.
const HEADER_SIZE: usize = 4;

/// Largest known layout (v2_4); the read buffer is sized to it.
const MAX_TABLE_SIZE: usize = 164;

/// Sentinel for an absent 16-bit field.
const INVALID_METRIC: u16 = 0xFFFF;

/// RDNA 3 firmware asserts the hotspot throttle bit near-permanently, so it
/// is cleared before the temperature range is extracted (desktop format
/// only).
const TEMP_HOTSPOT_BIT: u64 = 33;

// Field offsets in the desktop layout (v1_3).
mod v1 {
    pub const TEMPERATURE_EDGE: usize = 4;
    pub const AVERAGE_GFX_ACTIVITY: usize = 16;
    pub const AVERAGE_SOCKET_POWER: usize = 22;
    pub const CURRENT_GFXCLK: usize = 54;
    pub const CURRENT_UCLK: usize = 58;
    pub const CURRENT_FAN_SPEED: usize = 72;
    pub const INDEP_THROTTLE_STATUS: usize = 112;
}

// Field offsets in the APU layout (v2_2 base; the average_* block exists
// from content revision 3 on).
mod v2 {
    pub const TEMPERATURE_GFX: usize = 4;
    pub const TEMPERATURE_CORE: usize = 8;
    pub const AVERAGE_GFX_ACTIVITY: usize = 28;
    pub const AVERAGE_CPU_POWER: usize = 42;
    pub const AVERAGE_GFX_POWER: usize = 46;
    pub const AVERAGE_CORE_POWER: usize = 48;
    pub const AVERAGE_GFXCLK_FREQUENCY: usize = 64;
    pub const AVERAGE_UCLK_FREQUENCY: usize = 68;
    pub const CURRENT_GFXCLK: usize = 76;
    pub const CURRENT_UCLK: usize = 80;
    pub const INDEP_THROTTLE_STATUS: usize = 120;
    pub const AVERAGE_TEMPERATURE_GFX: usize = 128;
    pub const AVERAGE_TEMPERATURE_CORE: usize = 132;

    pub const CORE_ARRAY_LEN: usize = 8;
}

#[derive(Debug, Error)]
pub enum GpuMetricsError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read metrics header")]
    ShortHeader,
    #[error("unsupported gpu_metrics version: {format}.{content}")]
    UnsupportedVersion { format: u8, content: u8 },
}

/// Normalized record decoded from one successful poll.
#[derive(Debug, Clone, Copy)]
pub struct DecodedGpuMetrics {
    pub load_percent: i32,
    /// Graphics power draw in watts; -1.0 until a poll provides it.
    pub power_w: f32,
    pub core_clock_mhz: i32,
    pub memory_clock_mhz: i32,
    pub temperature_c: i32,
    pub cpu_power_w: f32,
    pub cpu_temperature_c: i32,
    pub fan_speed: i32,
    pub is_power_throttled: bool,
    pub is_current_throttled: bool,
    pub is_temp_throttled: bool,
    pub is_other_throttled: bool,
}

impl Default for DecodedGpuMetrics {
    fn default() -> Self {
        Self {
            load_percent: 0,
            power_w: -1.0,
            core_clock_mhz: 0,
            memory_clock_mhz: 0,
            temperature_c: 0,
            cpu_power_w: 0.0,
            cpu_temperature_c: 0,
            fan_speed: 0,
            is_power_throttled: false,
            is_current_throttled: false,
            is_temp_throttled: false,
            is_other_throttled: false,
        }
    }
}

/// Reads and decodes the versioned metrics file of one device.
pub struct GpuMetricsDecoder {
    file: Option<File>,
    buf: Vec<u8>,
    format_revision: u8,
    content_revision: u8,
    is_apu: bool,
    pub metrics: DecodedGpuMetrics,
}

impl GpuMetricsDecoder {
    pub fn new() -> Self {
        Self {
            file: None,
            buf: vec![0u8; MAX_TABLE_SIZE],
            format_revision: 0,
            content_revision: 0,
            is_apu: false,
            metrics: DecodedGpuMetrics::default(),
        }
    }

    /// Opens `path` and validates its header. On success the decoder is
    /// ready to poll; any failure leaves it inert.
    pub fn setup(&mut self, path: &Path) -> Result<(), GpuMetricsError> {
        let mut file = File::open(path).map_err(|source| GpuMetricsError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let mut header = [0u8; HEADER_SIZE];
        let read = read_available(&mut file, &mut header);
        if read < HEADER_SIZE {
            return Err(GpuMetricsError::ShortHeader);
        }

        let format = header[2];
        let content = header[3];
        debug!("gpu_metrics version: {}.{}", format, content);

        let accepted = match format {
            // v1_0 is not naturally aligned and not supported
            1 => (1..=3).contains(&content),
            // v2_0 likewise; v2_1..v2_4 mark the device as an APU
            2 => (1..=4).contains(&content),
            _ => false,
        };

        if !accepted {
            warn!("unsupported gpu_metrics version: {}.{}", format, content);
            return Err(GpuMetricsError::UnsupportedVersion { format, content });
        }

        self.is_apu = format == 2;
        self.format_revision = format;
        self.content_revision = content;
        self.file = Some(file);
        Ok(())
    }

    pub fn is_apu(&self) -> bool {
        self.is_apu
    }

    /// Re-reads and decodes the metrics file. A short or failed read leaves
    /// the previous record in place; stale-but-valid beats a gap.
    pub fn poll(&mut self) {
        let file = match &mut self.file {
            Some(file) => file,
            None => return,
        };

        if file.seek(SeekFrom::Start(0)).is_err() {
            return;
        }

        self.buf.fill(0);
        let bytes_read = read_available(file, &mut self.buf);
        if bytes_read < HEADER_SIZE {
            debug!("failed to read gpu_metrics header");
            return;
        }

        let buf = &self.buf[..];
        let mut throttle_status = 0u64;

        match self.format_revision {
            1 => {
                parse_v1(&mut self.metrics, buf);
                throttle_status = u64_at(buf, v1::INDEP_THROTTLE_STATUS);
                throttle_status &= !(1u64 << TEMP_HOTSPOT_BIT);
            }
            2 => {
                parse_v2(&mut self.metrics, buf, self.content_revision);
                if self.content_revision >= 2 {
                    throttle_status = u64_at(buf, v2::INDEP_THROTTLE_STATUS);
                }
            }
            _ => return,
        }

        // Independent throttle status word: fixed bit ranges per category
        self.metrics.is_power_throttled = (throttle_status & 0xFF) != 0;
        self.metrics.is_current_throttled = ((throttle_status >> 16) & 0xFF) != 0;
        self.metrics.is_temp_throttled = ((throttle_status >> 32) & 0xFFFF) != 0;
        self.metrics.is_other_throttled = ((throttle_status >> 56) & 0xFF) != 0;
    }
}

/// Desktop layout: scalar fields only, no sentinel filtering needed.
fn parse_v1(m: &mut DecodedGpuMetrics, buf: &[u8]) {
    m.load_percent = u16_at(buf, v1::AVERAGE_GFX_ACTIVITY) as i32;
    m.power_w = u16_at(buf, v1::AVERAGE_SOCKET_POWER) as f32;
    m.core_clock_mhz = u16_at(buf, v1::CURRENT_GFXCLK) as i32;
    m.memory_clock_mhz = u16_at(buf, v1::CURRENT_UCLK) as i32;
    m.temperature_c = u16_at(buf, v1::TEMPERATURE_EDGE) as i32;
    m.fan_speed = u16_at(buf, v1::CURRENT_FAN_SPEED) as i32;
}

/// APU layout: each target consults its candidate fields in order.
fn parse_v2(m: &mut DecodedGpuMetrics, buf: &[u8], content: u8) {
    m.load_percent = u16_at(buf, v2::AVERAGE_GFX_ACTIVITY) as i32;
    m.power_w = u16_at(buf, v2::AVERAGE_GFX_POWER) as f32 / 1000.0;

    let cpu_power = u16_at(buf, v2::AVERAGE_CPU_POWER);
    if cpu_power != INVALID_METRIC {
        m.cpu_power_w = cpu_power as f32 / 1000.0;
    } else if let Some(sum) = sum_valid_u16(buf, v2::AVERAGE_CORE_POWER, v2::CORE_ARRAY_LEN) {
        // fallback: per-core power summed until the first absent entry
        m.cpu_power_w = sum as f32 / 1000.0;
    }

    let temp_gfx = u16_at(buf, v2::TEMPERATURE_GFX);
    if temp_gfx != INVALID_METRIC {
        m.temperature_c = (temp_gfx / 100) as i32;
    } else if content >= 3 {
        let avg = u16_at(buf, v2::AVERAGE_TEMPERATURE_GFX);
        if avg != INVALID_METRIC {
            m.temperature_c = (avg / 100) as i32;
        }
    }

    if let Some(max) = max_valid_u16(buf, v2::TEMPERATURE_CORE, v2::CORE_ARRAY_LEN) {
        m.cpu_temperature_c = (max / 100) as i32;
    } else if content >= 3 {
        if let Some(max) = max_valid_u16(buf, v2::AVERAGE_TEMPERATURE_CORE, v2::CORE_ARRAY_LEN) {
            m.cpu_temperature_c = (max / 100) as i32;
        }
    }

    let gfxclk = u16_at(buf, v2::CURRENT_GFXCLK);
    if gfxclk != INVALID_METRIC {
        m.core_clock_mhz = gfxclk as i32;
    } else {
        let avg = u16_at(buf, v2::AVERAGE_GFXCLK_FREQUENCY);
        if avg != INVALID_METRIC {
            m.core_clock_mhz = avg as i32;
        }
    }

    let uclk = u16_at(buf, v2::CURRENT_UCLK);
    if uclk != INVALID_METRIC {
        m.memory_clock_mhz = uclk as i32;
    } else {
        let avg = u16_at(buf, v2::AVERAGE_UCLK_FREQUENCY);
        if avg != INVALID_METRIC {
            m.memory_clock_mhz = avg as i32;
        }
    }
}

impl Default for GpuMetricsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads as many bytes as the file yields, tolerating short reads.
fn read_available(file: &mut File, buf: &mut [u8]) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => break,
        }
    }
    total
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    match buf.get(offset..offset + 2) {
        Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
        None => INVALID_METRIC,
    }
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    match buf.get(offset..offset + 8) {
        Some(bytes) => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_le_bytes(raw)
        }
        None => 0,
    }
}

/// Maximum over a u16 array, stopping at the first absent entry. `None` when
/// the first entry is already absent.
fn max_valid_u16(buf: &[u8], offset: usize, len: usize) -> Option<u16> {
    let mut max: Option<u16> = None;

    for i in 0..len {
        let value = u16_at(buf, offset + i * 2);
        if value == INVALID_METRIC {
            break;
        }
        max = Some(max.map_or(value, |m| m.max(value)));
    }

    max
}

/// Sum over a u16 array, stopping at the first absent entry.
fn sum_valid_u16(buf: &[u8], offset: usize, len: usize) -> Option<u64> {
    let mut sum: Option<u64> = None;

    for i in 0..len {
        let value = u16_at(buf, offset + i * 2);
        if value == INVALID_METRIC {
            break;
        }
        sum = Some(sum.unwrap_or(0) + value as u64);
    }

    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn header(format: u8, content: u8) -> [u8; 4] {
        [0, 0, format, content]
    }

    fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
        buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn write_blob(dir: &Path, blob: &[u8]) -> std::path::PathBuf {
        let path = dir.join("gpu_metrics");
        fs::write(&path, blob).expect("write blob");
        path
    }

    // -------------------------------------------------------------------------
    // Tests for header validation
    // -------------------------------------------------------------------------

    #[test]
    fn test_version_acceptance_matrix() {
        let dir = tempdir().expect("tempdir");

        let cases: &[(u8, u8, bool, bool)] = &[
            // format, content, accepted, apu
            (1, 0, false, false),
            (1, 1, true, false),
            (1, 3, true, false),
            (1, 4, false, false),
            (2, 0, false, false),
            (2, 1, true, true),
            (2, 4, true, true),
            (2, 5, false, false),
            (3, 1, false, false),
            (0, 1, false, false),
        ];

        for &(format, content, accepted, apu) in cases {
            let path = write_blob(dir.path(), &header(format, content));
            let mut decoder = GpuMetricsDecoder::new();
            let result = decoder.setup(&path);
            assert_eq!(
                result.is_ok(),
                accepted,
                "format {} content {}",
                format,
                content
            );
            assert_eq!(decoder.is_apu(), apu);
        }
    }

    #[test]
    fn test_short_header_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = write_blob(dir.path(), &[0, 0, 1]);

        let mut decoder = GpuMetricsDecoder::new();
        assert!(matches!(
            decoder.setup(&path),
            Err(GpuMetricsError::ShortHeader)
        ));
    }

    // -------------------------------------------------------------------------
    // Tests for desktop (v1) decoding
    // -------------------------------------------------------------------------

    #[test]
    fn test_v1_socket_power_passthrough() {
        let dir = tempdir().expect("tempdir");
        let mut blob = vec![0u8; 120];
        blob[..4].copy_from_slice(&header(1, 3));
        put_u16(&mut blob, v1::AVERAGE_SOCKET_POWER, 42);
        put_u16(&mut blob, v1::AVERAGE_GFX_ACTIVITY, 67);
        put_u16(&mut blob, v1::TEMPERATURE_EDGE, 71);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();

        assert!(!decoder.is_apu());
        assert_eq!(decoder.metrics.power_w, 42.0);
        assert_eq!(decoder.metrics.load_percent, 67);
        assert_eq!(decoder.metrics.temperature_c, 71);
    }

    #[test]
    fn test_v1_hotspot_throttle_bit_cleared() {
        let dir = tempdir().expect("tempdir");
        let mut blob = vec![0u8; 120];
        blob[..4].copy_from_slice(&header(1, 3));
        // only the spurious hotspot bit set: no temp throttle reported
        put_u64(&mut blob, v1::INDEP_THROTTLE_STATUS, 1u64 << 33);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();
        assert!(!decoder.metrics.is_temp_throttled);

        // another temperature bit still reports
        put_u64(&mut blob, v1::INDEP_THROTTLE_STATUS, (1u64 << 33) | (1u64 << 34));
        write_blob(dir.path(), &blob);
        decoder.poll();
        assert!(decoder.metrics.is_temp_throttled);
    }

    #[test]
    fn test_throttle_bit_ranges() {
        let dir = tempdir().expect("tempdir");
        let mut blob = vec![0u8; 120];
        blob[..4].copy_from_slice(&header(1, 2));
        put_u64(
            &mut blob,
            v1::INDEP_THROTTLE_STATUS,
            (1u64 << 2) | (1u64 << 17) | (1u64 << 40) | (1u64 << 60),
        );
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();

        let m = &decoder.metrics;
        assert!(m.is_power_throttled);
        assert!(m.is_current_throttled);
        assert!(m.is_temp_throttled);
        assert!(m.is_other_throttled);
    }

    // -------------------------------------------------------------------------
    // Tests for APU (v2) decoding
    // -------------------------------------------------------------------------

    fn v2_blob(content: u8) -> Vec<u8> {
        let mut blob = vec![0u8; MAX_TABLE_SIZE];
        blob[..4].copy_from_slice(&header(2, content));
        blob
    }

    #[test]
    fn test_v2_scalar_fields() {
        let dir = tempdir().expect("tempdir");
        let mut blob = v2_blob(2);
        put_u16(&mut blob, v2::AVERAGE_GFX_ACTIVITY, 55);
        put_u16(&mut blob, v2::AVERAGE_GFX_POWER, 15000); // mW
        put_u16(&mut blob, v2::AVERAGE_CPU_POWER, 9000); // mW
        put_u16(&mut blob, v2::TEMPERATURE_GFX, 6500); // centi-degrees
        put_u16(&mut blob, v2::CURRENT_GFXCLK, 1600);
        put_u16(&mut blob, v2::CURRENT_UCLK, 1000);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();

        assert!(decoder.is_apu());
        let m = &decoder.metrics;
        assert_eq!(m.load_percent, 55);
        assert!((m.power_w - 15.0).abs() < 1e-6);
        assert!((m.cpu_power_w - 9.0).abs() < 1e-6);
        assert_eq!(m.temperature_c, 65);
        assert_eq!(m.core_clock_mhz, 1600);
        assert_eq!(m.memory_clock_mhz, 1000);
    }

    #[test]
    fn test_v2_core_power_fallback_stops_at_sentinel() {
        let dir = tempdir().expect("tempdir");
        let mut blob = v2_blob(2);
        put_u16(&mut blob, v2::AVERAGE_CPU_POWER, INVALID_METRIC);
        // three valid cores then a sentinel; trailing garbage must not count
        put_u16(&mut blob, v2::AVERAGE_CORE_POWER, 2000);
        put_u16(&mut blob, v2::AVERAGE_CORE_POWER + 2, 3000);
        put_u16(&mut blob, v2::AVERAGE_CORE_POWER + 4, 1000);
        put_u16(&mut blob, v2::AVERAGE_CORE_POWER + 6, INVALID_METRIC);
        put_u16(&mut blob, v2::AVERAGE_CORE_POWER + 8, 9999);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();

        assert!((decoder.metrics.cpu_power_w - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_v2_average_temperature_fallback_needs_content_3() {
        let dir = tempdir().expect("tempdir");

        for (content, expected) in [(2u8, 0), (3u8, 72)] {
            let mut blob = v2_blob(content);
            put_u16(&mut blob, v2::TEMPERATURE_GFX, INVALID_METRIC);
            put_u16(&mut blob, v2::AVERAGE_TEMPERATURE_GFX, 7200);
            let path = write_blob(dir.path(), &blob);

            let mut decoder = GpuMetricsDecoder::new();
            decoder.setup(&path).expect("setup");
            decoder.poll();
            assert_eq!(decoder.metrics.temperature_c, expected, "content {}", content);
        }
    }

    #[test]
    fn test_v2_core_temperature_max() {
        let dir = tempdir().expect("tempdir");
        let mut blob = v2_blob(2);
        put_u16(&mut blob, v2::TEMPERATURE_CORE, 4500);
        put_u16(&mut blob, v2::TEMPERATURE_CORE + 2, 6100);
        put_u16(&mut blob, v2::TEMPERATURE_CORE + 4, 5300);
        put_u16(&mut blob, v2::TEMPERATURE_CORE + 6, INVALID_METRIC);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();

        assert_eq!(decoder.metrics.cpu_temperature_c, 61);
    }

    #[test]
    fn test_v2_throttle_needs_content_2() {
        let dir = tempdir().expect("tempdir");
        let mut blob = v2_blob(1);
        put_u64(&mut blob, v2::INDEP_THROTTLE_STATUS, 0xFF);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();
        assert!(!decoder.metrics.is_power_throttled);

        blob[3] = 2; // content revision 2: status word is now read
        let path = write_blob(dir.path(), &blob);
        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();
        assert!(decoder.metrics.is_power_throttled);
    }

    #[test]
    fn test_truncated_poll_keeps_previous_record() {
        let dir = tempdir().expect("tempdir");
        let mut blob = vec![0u8; 120];
        blob[..4].copy_from_slice(&header(1, 3));
        put_u16(&mut blob, v1::AVERAGE_GFX_ACTIVITY, 80);
        let path = write_blob(dir.path(), &blob);

        let mut decoder = GpuMetricsDecoder::new();
        decoder.setup(&path).expect("setup");
        decoder.poll();
        assert_eq!(decoder.metrics.load_percent, 80);

        // File truncated below header size mid-run: record must survive
        fs::write(&path, [0u8; 2]).expect("truncate");
        decoder.poll();
        assert_eq!(decoder.metrics.load_percent, 80);
    }
}
