//! gpu-telemetry-collector - version 0.1.0
//!
//! Binary front-end for the telemetry library: enumerates GPUs, polls the
//! CPU and memory collectors on the same cadence, and prints the published
//! snapshots either as log lines or as JSON for machine consumers.

mod cli;

use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;
use tracing::{info, Level};

use cli::{Args, LogLevel};
use gpu_telemetry_collector::cpu::CpuCollector;
use gpu_telemetry_collector::gpu::enumerate::enumerate_gpus;
use gpu_telemetry_collector::memory::read_ram_info;
use gpu_telemetry_collector::snapshot::{
    CpuCoreInfo, CpuInfo, GpuProcessSnapshot, GpuSystemSnapshot, MemoryInfo,
};

/// One printed JSON snapshot across all collectors.
#[derive(Serialize)]
struct SnapshotLine {
    gpus: Vec<GpuLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<CpuInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cores: Vec<CpuCoreInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<MemoryInfo>,
}

#[derive(Serialize)]
struct GpuLine {
    drm_node: String,
    driver: String,
    system: GpuSystemSnapshot,
    processes: BTreeMap<u32, GpuProcessSnapshot>,
}

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args);

    let gpus = enumerate_gpus();
    info!("found {} supported GPU(s)", gpus.len());

    for gpu in &gpus {
        for &pid in &args.pids {
            gpu.register_pid(pid);
        }
    }

    let mut cpu = if args.no_cpu {
        None
    } else {
        Some(CpuCollector::new())
    };

    let mut cycles = 0u64;

    loop {
        thread::sleep(Duration::from_secs(args.interval));

        if let Some(cpu) = &mut cpu {
            cpu.poll();
        }

        let line = SnapshotLine {
            gpus: gpus
                .iter()
                .map(|gpu| {
                    let snapshots = gpu.snapshots();
                    GpuLine {
                        drm_node: gpu.info.drm_node.clone(),
                        driver: gpu.info.driver.clone(),
                        system: snapshots.system,
                        processes: snapshots.processes.into_iter().collect(),
                    }
                })
                .collect(),
            cpu: cpu.as_ref().map(|cpu| cpu.info()),
            cores: cpu.as_ref().map(|cpu| cpu.cores().to_vec()).unwrap_or_default(),
            memory: (!args.no_memory).then(read_ram_info),
        };

        if args.json {
            println!("{}", serde_json::to_string(&line)?);
        } else {
            print_snapshot(&line);
        }

        cycles += 1;
        if let Some(count) = args.count {
            if cycles >= count {
                break;
            }
        }
    }

    Ok(())
}

fn print_snapshot(line: &SnapshotLine) {
    for gpu in &line.gpus {
        let s = &gpu.system;
        info!(
            "{} ({}): load {}% | vram {:.2}/{:.2} GiB | {} MHz | {}°C | {:.1}W / {:.1}W",
            gpu.drm_node,
            gpu.driver,
            s.load,
            s.vram_used,
            s.memory_total,
            s.core_clock,
            s.temperature,
            s.power_usage,
            s.power_limit,
        );

        for (pid, process) in &gpu.processes {
            info!(
                "  pid {}: load {}% | vram {:.2} GiB | gtt {:.2} GiB",
                pid, process.load, process.vram_used, process.gtt_used
            );
        }
    }

    if let Some(cpu) = &line.cpu {
        info!(
            "cpu: load {}% | {} MHz | {}°C | {:.1}W",
            cpu.load, cpu.frequency, cpu.temperature, cpu.power
        );
    }

    if let Some(memory) = &line.memory {
        info!(
            "ram: {:.2}/{:.2} GiB used | swap {:.2} GiB",
            memory.used, memory.total, memory.swap_used
        );
    }
}
