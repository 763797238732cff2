//! CLI Entry Point for daq-loop
//!
//! Provides command-line interface for:
//! - Running a simulated acquisition session for a fixed duration
//! - Validating a configuration file
//!
//! # Usage
//!
//! ```bash
//! daq-loop run --config config/daq_loop.toml --duration 5s
//! daq-loop check-config config/daq_loop.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use tracing::{error, info};

use daq_loop::config::{LoopConfig, DEFAULT_CONFIG_PATH};
use daq_loop::logging::{self, OutputFormat, TracingConfig};
use daq_loop::{BlockView, ChannelId, ReadLoop, Session, SimulatedDevice};

#[derive(Parser)]
#[command(name = "daq-loop")]
#[command(
    about = "Continuous multi-channel acquisition with a background poller",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from the simulated device and print per-channel statistics
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// How long to acquire (e.g. 500ms, 5s, 1m)
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Log output format (pretty, compact, json)
        #[arg(long, default_value = "pretty")]
        format: OutputFormat,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        path: PathBuf,
    },
}

/// Per-channel tallies kept by the CLI sink.
#[derive(Default)]
struct Tally {
    blocks: u64,
    bytes: u64,
    last_first_sample: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration,
            format,
        } => run(config, duration, format),
        Commands::CheckConfig { path } => check_config(path),
    }
}

fn load(path: &Path) -> Result<LoopConfig> {
    let config = LoopConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn run(path: PathBuf, duration: Duration, format: OutputFormat) -> Result<()> {
    let config = load(&path)?;
    logging::init(TracingConfig::from_loop_config(&config)?.with_format(format))?;

    info!(
        app = %config.application.name,
        channels = config.channels.len(),
        ?duration,
        "Starting acquisition"
    );

    let session = Session::open(
        SimulatedDevice::new(config.simulation.clone()),
        config.channels.clone(),
        config.poller.clone(),
    )?;

    let mut tallies: BTreeMap<ChannelId, Tally> = BTreeMap::new();
    let mut sink = |block: BlockView<'_>| {
        let tally = tallies.entry(block.channel()).or_default();
        tally.blocks += 1;
        tally.bytes += block.bytes().len() as u64;
        tally.last_first_sample = block
            .analog_line(0)
            .first()
            .map(|v| format!("{v:.4}"))
            .or_else(|| block.digital_line(0).first().map(|v| format!("{v:#010x}")));
    };

    let outcome = ReadLoop::new(session.reader())
        .with_idle_backoff(config.poller.idle_backoff)
        .run_for(&mut sink, duration);

    let report = session.close();

    println!("channel  blocks      bytes  device_errors  starved  discarded  last");
    for channel in &report.channels {
        let tally = tallies.remove(&channel.id).unwrap_or_default();
        println!(
            "{:>7}  {:>6}  {:>9}  {:>13}  {:>7}  {:>9}  {}",
            channel.id,
            tally.blocks,
            tally.bytes,
            channel.stats.device_errors,
            channel.stats.starved_visits,
            channel.drain.filled_discarded,
            tally.last_first_sample.as_deref().unwrap_or("-"),
        );
    }

    match outcome {
        Ok(summary) => {
            info!(blocks = summary.blocks, bytes = summary.bytes, "Acquisition finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Acquisition stopped");
            Err(e.into())
        }
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!(
        "{}: ok ({} channels, idle_backoff {}, read_timeout {}, sizing_error_policy {:?})",
        path.display(),
        config.channels.len(),
        humantime::format_duration(config.poller.idle_backoff),
        humantime::format_duration(config.poller.read_timeout),
        config.poller.sizing_error_policy,
    );
    for channel in &config.channels {
        println!(
            "  {} [{}] {} x {} samples, {} bytes per buffer",
            channel.label(),
            channel.kind,
            channel.lines,
            channel.samples_per_chan,
            channel.buffer_len()
        );
    }
    Ok(())
}
