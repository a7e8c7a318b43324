//! CLI arguments for gpu-telemetry-collector.
//!
//! This module defines the command-line interface structure using the clap
//! library.

use clap::{Parser, ValueEnum};

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "gpu-telemetry-collector",
    about = "GPU and CPU hardware telemetry collector for Linux overlays",
    long_about = "GPU and CPU hardware telemetry collector for Linux overlays.\n\n\
                  Discovers every supported GPU render node, samples load, clocks, power,\n\
                  temperatures, throttle state and per-process engine time on a background\n\
                  cadence, and prints the published snapshots.",
    author = "Michael Moll <telemetry@herakles.now> - Herakles",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Seconds between printed snapshots
    #[arg(short = 'i', long, default_value_t = 1)]
    pub interval: u64,

    /// Stop after N snapshots (run forever when omitted)
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Track per-process GPU metrics for these pids
    #[arg(short = 'p', long = "pid")]
    pub pids: Vec<u32>,

    /// Emit snapshots as JSON lines instead of log output
    #[arg(long)]
    pub json: bool,

    /// Skip CPU metrics
    #[arg(long)]
    pub no_cpu: bool,

    /// Skip system RAM metrics
    #[arg(long)]
    pub no_memory: bool,
}
