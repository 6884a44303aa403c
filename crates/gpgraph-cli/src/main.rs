//! Command-graph engine CLI.
//!
//! Provides the `gpgraph` binary, which drives graphs described in JSON
//! scripts on the simulated device:
//! - `run`: build, instantiate, launch N times and print a JSON summary
//! - `validate`: instantiate only and print the diagnostics
//! - `dot`: print the Graphviz rendering of the graph
//!
//! Reads configuration from environment variables:
//! - `GPGRAPH_MEMORY_CAPACITY`: simulated device memory in bytes
//! - `GPGRAPH_WORKERS`: device runtime worker threads
//! - `GPGRAPH_LOG`: tracing filter (default: "warn")

mod script;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use gpgraph_exec::{InstantiateError, InstantiateOptions, DEFAULT_LOG_CAPACITY};
use gpgraph_runtime::{Device, DeviceConfig, QueueError};

use crate::script::{Script, ScriptError};

/// Command-graph capture and replay on a simulated device.
#[derive(Parser)]
#[command(name = "gpgraph", about = "Command-graph capture and replay on a simulated device")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Build, instantiate and launch a graph script.
    Run {
        /// Path to the JSON graph script.
        script: PathBuf,

        /// Number of launches.
        #[arg(short, long, default_value_t = 1)]
        replays: u32,

        /// Free allocations left live by the previous launch when relaunching.
        #[arg(long)]
        auto_free: bool,
    },
    /// Instantiate a graph script without launching it.
    Validate {
        /// Path to the JSON graph script.
        script: PathBuf,

        /// Capacity of the diagnostic log in bytes.
        #[arg(long, default_value_t = DEFAULT_LOG_CAPACITY)]
        log_capacity: usize,
    },
    /// Print the Graphviz rendering of a graph script.
    Dot {
        /// Path to the JSON graph script.
        script: PathBuf,
    },
}

/// Printed by `run`.
#[derive(Debug, Serialize)]
struct RunSummary {
    nodes: usize,
    edges: usize,
    replays: u64,
    kernel_launches: u64,
    memory_used: u64,
    /// Final contents of every script buffer.
    buffers: BTreeMap<String, Vec<u8>>,
}

/// Printed by `validate`.
#[derive(Debug, Serialize)]
struct ValidateReport {
    valid: bool,
    nodes: usize,
    edges: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    diagnostics: Vec<String>,
    truncated: bool,
}

/// Exit codes: 0 = success, 1 = device error, 2 = validation failure,
/// 3 = unreadable or malformed script.
const EXIT_DEVICE: i32 = 1;
const EXIT_INVALID: i32 = 2;
const EXIT_SCRIPT: i32 = 3;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("GPGRAPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Run {
            script,
            replays,
            auto_free,
        } => run(&script, replays, auto_free),
        Commands::Validate {
            script,
            log_capacity,
        } => validate(&script, log_capacity),
        Commands::Dot { script } => dot(&script),
    };
    process::exit(exit_code);
}

fn start_device() -> Result<Device, QueueError> {
    let config = DeviceConfig::from_env();
    tracing::debug!(?config, "starting device");
    Device::new(config)
}

/// Execute the run subcommand.
fn run(path: &Path, replays: u32, auto_free: bool) -> i32 {
    let script = match Script::read(path) {
        Ok(s) => s,
        Err(e) => return report_script_error(path, &e),
    };
    let device = match start_device() {
        Ok(d) => d,
        Err(e) => return report_device_error(&e),
    };
    let loaded = match script.load(&device) {
        Ok(l) => l,
        Err(e) => return report_script_error(path, &e),
    };

    let options = InstantiateOptions {
        auto_free_on_launch: auto_free,
        ..InstantiateOptions::default()
    };
    let exec = match device.instantiate(&loaded.graph, &options) {
        Ok(exec) => exec,
        Err(QueueError::Instantiate(e)) => return report_invalid(&e),
        Err(e) => return report_device_error(&e),
    };

    let queue = match device.create_queue() {
        Ok(q) => q,
        Err(e) => return report_device_error(&e),
    };
    for _ in 0..replays {
        if let Err(e) = queue.launch(&exec) {
            return report_device_error(&e);
        }
    }
    if let Err(e) = queue.synchronize() {
        return report_device_error(&e);
    }

    let mut buffers = BTreeMap::new();
    for (name, ptr, size) in &loaded.buffers {
        match device.read(*ptr, *size) {
            Ok(bytes) => {
                buffers.insert(name.clone(), bytes);
            }
            Err(e) => return report_device_error(&e),
        }
    }
    let stats = device.stats();
    let summary = RunSummary {
        nodes: loaded.graph.node_count(),
        edges: loaded.graph.edge_count(),
        replays: stats.replays,
        kernel_launches: stats.kernel_launches,
        memory_used: stats.memory_used,
        buffers,
    };
    print_json(&summary);
    0
}

/// Execute the validate subcommand.
fn validate(path: &Path, log_capacity: usize) -> i32 {
    let script = match Script::read(path) {
        Ok(s) => s,
        Err(e) => return report_script_error(path, &e),
    };
    let device = match start_device() {
        Ok(d) => d,
        Err(e) => return report_device_error(&e),
    };
    let loaded = match script.load(&device) {
        Ok(l) => l,
        Err(e) => return report_script_error(path, &e),
    };

    let options = InstantiateOptions {
        log_capacity,
        ..InstantiateOptions::default()
    };
    let mut report = ValidateReport {
        valid: true,
        nodes: loaded.graph.node_count(),
        edges: loaded.graph.edge_count(),
        error: None,
        diagnostics: Vec::new(),
        truncated: false,
    };
    let code = match device.instantiate(&loaded.graph, &options) {
        Ok(_) => 0,
        Err(QueueError::Instantiate(e)) => {
            report.valid = false;
            report.error = Some(e.to_string());
            if let Some(log) = e.log() {
                report.diagnostics = log.lines().map(str::to_string).collect();
                report.truncated = log.is_truncated();
            }
            EXIT_INVALID
        }
        Err(e) => return report_device_error(&e),
    };
    print_json(&report);
    code
}

/// Execute the dot subcommand.
fn dot(path: &Path) -> i32 {
    let script = match Script::read(path) {
        Ok(s) => s,
        Err(e) => return report_script_error(path, &e),
    };
    let device = match start_device() {
        Ok(d) => d,
        Err(e) => return report_device_error(&e),
    };
    match script.load(&device) {
        Ok(loaded) => {
            print!("{}", gpgraph_core::dot::to_dot(&loaded.graph));
            0
        }
        Err(e) => report_script_error(path, &e),
    }
}

fn print_json<T: Serialize>(value: &T) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {}\"}}", e));
    println!("{}", json);
}

fn report_script_error(path: &Path, error: &ScriptError) -> i32 {
    match error {
        ScriptError::Device(e) => report_device_error(e),
        _ => {
            eprintln!("Error: {}: {}", path.display(), error);
            EXIT_SCRIPT
        }
    }
}

fn report_invalid(error: &InstantiateError) -> i32 {
    eprintln!("Validation failed: {}", error);
    if let Some(log) = error.log() {
        for line in log.lines() {
            eprintln!("  - {}", line);
        }
    }
    EXIT_INVALID
}

fn report_device_error(error: &QueueError) -> i32 {
    eprintln!("Device error: {}", error);
    EXIT_DEVICE
}
