// SPDX-License-Identifier: MIT
#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

mod config;
mod error;
mod recording;
mod report;
mod sampler;
mod session;
mod sync;
mod telemetry;
#[cfg(test)]
mod testing;
mod workload;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use num_format::{Locale, ToFormattedString};

use crate::config::SessionConfig;
use crate::recording::reader::RecordingReader;
use crate::session::SessionId;
use crate::sync::{RunningSession, SessionOutcome, Synchronizer};
use crate::telemetry::nvidia_smi::NvidiaSmiSource;
use crate::telemetry::simulated::SimulatedSensor;
use crate::telemetry::{TelemetrySource, hardware};
use crate::workload::WorkloadKind;
use crate::workload::counters::ThroughputCounters;
use crate::workload::device::DeviceBackend;

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HEADLESS_STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "gpuburn",
    about = "gpuburn: GPU stress test with synchronized telemetry"
)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stress-test session and print its report
    Run(RunArgs),
    /// Print the report of a recorded session
    Report { path: PathBuf },
    /// Export a recording to CSV
    Export {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Export workload events instead of telemetry
        #[arg(long)]
        events: bool,
    },
    /// Open the GPU sensor, print one reading and release it
    Probe {
        #[arg(long, default_value = "0")]
        device: u32,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Session length in seconds; 0 removes the time limit
    #[arg(short, long)]
    duration: Option<u64>,
    /// Stop after this many work units
    #[arg(short, long)]
    iterations: Option<u64>,
    /// Telemetry sample period in milliseconds
    #[arg(short, long)]
    sample_period: Option<u64>,
    /// Sensor readings discarded before the load starts
    #[arg(long)]
    warmup: Option<u32>,
    #[arg(long, value_enum, default_value_t = SensorKind::Auto)]
    sensor: SensorKind,
    #[arg(long, default_value = "0")]
    device: u32,
    #[arg(short, long, value_enum)]
    workload: Option<WorkloadKind>,
    /// Elements (compute) or pixels (render) per pass
    #[arg(long)]
    work_size: Option<u32>,
    #[arg(long)]
    passes: Option<u32>,
    /// Abort once the GPU reaches this temperature (C)
    #[arg(long)]
    temp_limit: Option<f32>,
    /// TOML session config; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Write the finalized session to this file
    #[arg(short, long)]
    record: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SensorKind {
    /// nvidia-smi if a device answers, simulated otherwise
    Auto,
    NvidiaSmi,
    Simulated,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run(args) => cmd_run(&args),
        Commands::Report { path } => cmd_report(&path),
        Commands::Export {
            input,
            output,
            events,
        } => cmd_export(&input, &output, events),
        Commands::Probe { device } => cmd_probe(device),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

fn install_signal_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("failed to register SIGTERM handler")?;
    Ok(shutdown)
}

// ---------------------------------------------------------------------------
// Run subcommand
// ---------------------------------------------------------------------------

impl RunArgs {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_toml_file(path)?,
            None => SessionConfig::default(),
        };

        if let Some(secs) = self.duration {
            config.duration_ms = (secs > 0).then(|| secs.saturating_mul(1000));
        }
        if let Some(n) = self.iterations {
            config.max_iterations = Some(n);
        }
        if let Some(ms) = self.sample_period {
            config.sample_interval_ms = ms;
        }
        if let Some(n) = self.warmup {
            config.warmup_readings = n;
        }
        if let Some(kind) = self.workload {
            config.workload.kind = kind;
        }
        if let Some(size) = self.work_size {
            config.workload.work_size = size;
        }
        if let Some(passes) = self.passes {
            config.workload.passes = passes;
        }
        if let Some(limit) = self.temp_limit {
            config.temperature_limit_c = Some(limit);
        }
        Ok(config)
    }
}

fn open_sensor(
    kind: SensorKind,
    device: u32,
    counters: &Arc<ThroughputCounters>,
) -> Result<Box<dyn TelemetrySource>> {
    let simulated = || -> Box<dyn TelemetrySource> {
        Box::new(SimulatedSensor::new(
            Arc::clone(counters),
            SessionId::generate().as_u64(),
        ))
    };

    match kind {
        SensorKind::Simulated => Ok(simulated()),
        SensorKind::NvidiaSmi => {
            let handle = hardware::acquire(device).context("failed to open GPU sensor")?;
            Ok(Box::new(NvidiaSmiSource::new(handle)))
        }
        SensorKind::Auto => match hardware::acquire(device) {
            Ok(handle) => Ok(Box::new(NvidiaSmiSource::new(handle))),
            Err(e) => {
                log::warn!("{e}; using the simulated sensor");
                Ok(simulated())
            }
        },
    }
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = args.session_config()?;
    let shutdown = install_signal_handler()?;

    let counters = Arc::new(ThroughputCounters::default());
    let source = open_sensor(args.sensor, args.device, &counters)?;
    let synchronizer =
        Synchronizer::with_counters(source, Box::new(DeviceBackend::new()), counters);

    let outcome = run_session(synchronizer, config, &shutdown)?;

    let stdout = io::stdout();
    report::text::write_report(
        &mut stdout.lock(),
        outcome.session.metadata(),
        &outcome.report,
    )
    .context("failed to print report")?;

    if let Some(path) = &args.record {
        let records = recording::writer::save(path, &outcome.session)?;
        eprintln!(
            "Recorded {} records to {}",
            records.to_formatted_string(&Locale::en),
            path.display()
        );
    }
    Ok(())
}

/// Runs one session to completion and releases the sensor handle whether or
/// not it succeeded.
fn run_session(
    synchronizer: Synchronizer,
    config: SessionConfig,
    shutdown: &AtomicBool,
) -> Result<SessionOutcome> {
    let result = synchronizer
        .start(config)
        .context("failed to start session")
        .and_then(|session| {
            watch_session(&session, shutdown);
            session.wait().context("session failed")
        });
    hardware::shutdown();
    result
}

/// Forwards Ctrl-C to the session and prints progress until it finishes.
fn watch_session(session: &RunningSession, shutdown: &AtomicBool) {
    let mut last_status = Instant::now();
    let mut cancelled = false;

    while !session.is_finished() {
        if !cancelled && shutdown.load(Ordering::Relaxed) {
            eprintln!("\nInterrupted, stopping session...");
            session.cancel();
            cancelled = true;
        }
        if last_status.elapsed() >= HEADLESS_STATUS_INTERVAL {
            print_session_status(session);
            last_status = Instant::now();
        }
        std::thread::sleep(SESSION_POLL_INTERVAL);
    }
}

fn print_session_status(session: &RunningSession) {
    let elapsed = session.elapsed();
    let snap = session.throughput();
    let throttled = if session.is_throttled() {
        " [throttled]"
    } else {
        ""
    };
    eprintln!(
        "  [{}s] {}{throttled}: {} iterations ({} failed), {:.1} it/s, {:.1}s busy, backpressure x{}",
        elapsed.as_secs(),
        session.phase(),
        snap.iterations.to_formatted_string(&Locale::en),
        snap.failed.to_formatted_string(&Locale::en),
        snap.iterations_per_sec(elapsed),
        snap.cumulative_busy().as_secs_f64(),
        session.backpressure_engagements()
    );
}

// ---------------------------------------------------------------------------
// Report subcommand
// ---------------------------------------------------------------------------

fn cmd_report(path: &Path) -> Result<()> {
    let session = RecordingReader::open(path)?.into_session();
    let report = report::finalize(&session);
    let stdout = io::stdout();
    report::text::write_report(&mut stdout.lock(), session.metadata(), &report)
        .context("failed to print report")
}

// ---------------------------------------------------------------------------
// Export subcommand
// ---------------------------------------------------------------------------

fn cmd_export(input: &Path, output: &Path, events: bool) -> Result<()> {
    let reader = RecordingReader::open(input)?;

    let file = std::fs::File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut out = io::BufWriter::new(file);

    let rows = if events {
        writeln!(out, "iteration,timestamp_ns,duration_ns,status")
            .context("failed to write CSV header")?;
        for e in reader.events() {
            writeln!(
                out,
                "{},{},{},{}",
                e.iteration, e.timestamp_ns, e.duration_ns, e.status
            )
            .context("failed to write CSV row")?;
        }
        reader.events().len()
    } else {
        writeln!(
            out,
            "index,timestamp_ns,utilization_pct,temperature_c,clock_mhz,power_w,memory_used_mb,stale"
        )
        .context("failed to write CSV header")?;
        for (i, r) in reader.readings().iter().enumerate() {
            writeln!(
                out,
                "{i},{},{:.1},{:.1},{:.0},{:.2},{:.0},{}",
                r.timestamp_ns,
                r.utilization_pct,
                r.temperature_c,
                r.clock_mhz,
                r.power_w,
                r.memory_used_mb,
                r.stale
            )
            .context("failed to write CSV row")?;
        }
        reader.readings().len()
    };
    out.flush().context("failed to flush CSV")?;

    eprintln!(
        "Exported {} rows from {} to {}",
        rows.to_formatted_string(&Locale::en),
        input.display(),
        output.display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Probe subcommand
// ---------------------------------------------------------------------------

fn cmd_probe(device: u32) -> Result<()> {
    let handle = hardware::acquire(device).context("failed to open GPU sensor")?;
    println!(
        "GPU {}: {} (driver {})",
        handle.device_index(),
        handle.device_name(),
        handle.driver_version()
    );

    let mut source = NvidiaSmiSource::new(handle);
    let result = source.read();
    drop(source);
    hardware::shutdown();

    let values = result.context("sensor read failed")?;
    println!("  utilization  {:>8.1} %", values.utilization_pct);
    println!("  temperature  {:>8.1} C", values.temperature_c);
    println!("  clock        {:>8.0} MHz", values.clock_mhz);
    println!("  power        {:>8.2} W", values.power_w);
    println!("  memory used  {:>8.0} MB", values.memory_used_mb);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::hardware::SensorHandle;
    use crate::testing::{FixedSource, SleepBackend, hardware_lock};

    fn fake_open(index: u32) -> crate::error::Result<SensorHandle> {
        Ok(SensorHandle::new(index, "Test GPU".into(), "1.0".into()))
    }

    #[test]
    fn failed_session_still_releases_the_sensor() {
        let _guard = hardware_lock();
        hardware::shutdown();
        hardware::acquire_with(0, fake_open).unwrap();

        let synchronizer = Synchronizer::new(
            Box::new(FixedSource::default()),
            Box::new(SleepBackend::new(Duration::from_millis(1))),
        );
        let invalid = SessionConfig {
            sample_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert!(run_session(synchronizer, invalid, &AtomicBool::new(false)).is_err());

        // Held handles pin their device, so a different index only opens
        // once the old handle is gone.
        hardware::acquire_with(1, fake_open).unwrap();
        hardware::shutdown();
    }
}
