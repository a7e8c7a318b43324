//! End-to-end CPU load computation against synthetic counter files.
//!
//! Drives the collector through its public API with fixture stat/cpuinfo
//! files and verifies the delta arithmetic over two samples.

use std::path::Path;
use tempfile::tempdir;

use gpu_telemetry_collector::cpu::CpuCollector;

const NO_HWMON: &str = "/nonexistent/hwmon";
const NO_RAPL: &str = "/nonexistent/rapl";

#[test]
fn test_two_samples_yield_expected_load() {
    let dir = tempdir().expect("tempdir");
    let stat_path = dir.path().join("stat");
    let cpuinfo_path = dir.path().join("cpuinfo");

    // Sample 1: idle 800 of total 950
    std::fs::write(
        &stat_path,
        "cpu  100 0 50 800 0 0 0 0\ncpu0 50 0 25 400 0 0 0 0\ncpu1 50 0 25 400 0 0 0 0\n",
    )
    .expect("write stat");
    std::fs::write(
        &cpuinfo_path,
        "processor\t: 0\ncpu MHz\t\t: 2400.000\n\nprocessor\t: 1\ncpu MHz\t\t: 3100.000\n",
    )
    .expect("write cpuinfo");

    let mut cpu = CpuCollector::with_paths(
        &stat_path,
        &cpuinfo_path,
        Path::new(NO_HWMON),
        Path::new(NO_RAPL),
    );

    // First poll only primes the baselines
    cpu.poll();
    assert_eq!(cpu.info().load, 0);

    // Sample 2: aggregate idle delta 50, total delta 200 -> 75% busy
    std::fs::write(
        &stat_path,
        "cpu  220 0 80 850 0 0 0 0\ncpu0 110 0 40 425 0 0 0 0\ncpu1 110 0 40 425 0 0 0 0\n",
    )
    .expect("rewrite stat");
    cpu.poll();

    assert_eq!(cpu.info().load, 75);
    assert_eq!(cpu.cores().len(), 2);
    assert_eq!(cpu.cores()[0].load, 75);

    // Reported frequency is the fastest core, not an average
    assert_eq!(cpu.info().frequency, 3100);
    assert_eq!(cpu.cores()[0].frequency, 2400);
}

#[test]
fn test_counter_reset_does_not_explode() {
    let dir = tempdir().expect("tempdir");
    let stat_path = dir.path().join("stat");
    let cpuinfo_path = dir.path().join("cpuinfo");
    std::fs::write(&stat_path, "cpu  1000 0 500 8000 0 0 0 0\n").expect("write stat");
    std::fs::write(&cpuinfo_path, "").expect("write cpuinfo");

    let mut cpu = CpuCollector::with_paths(
        &stat_path,
        &cpuinfo_path,
        Path::new(NO_HWMON),
        Path::new(NO_RAPL),
    );
    cpu.poll();

    // Counters jump backwards (e.g. a rebooted container namespace): load
    // must stay in range instead of underflowing
    std::fs::write(&stat_path, "cpu  10 0 5 80 0 0 0 0\n").expect("rewrite stat");
    cpu.poll();
    assert!((0..=100).contains(&cpu.info().load));
}
