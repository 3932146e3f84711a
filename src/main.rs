//! CLI entry point for the FTS scan controller.
//!
//! Provides command-line access to the scan engine:
//! - `scan`: calibrate, then run a continuous scan until a stop condition
//!   (end of track, stationary carriage, Ctrl-C, or `--duration`)
//! - `position`: calibrate and print the current carriage position
//! - `plan`: print scan-planning numbers for an emission band
//!
//! Device selection (real hardware vs. mocks) comes entirely from the
//! configuration file, so `cryo_fts scan --velocity 2.0` against the
//! default mock bench is a full dry run of the engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cryo_fts::config::FtsConfig;
use cryo_fts::hardware::build_bench;
use cryo_fts::logging;
use cryo_fts::optics;
use cryo_fts::scan::{PositionAxis, ScanConfig, ScanEngine, ScanSettings, ScanState, StreamReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cryo_fts")]
#[command(about = "Cryogenic FTS scan controller", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a continuous scan to termination (Ctrl-C cancels)
    Scan {
        /// Magnitude of the scan velocity
        #[arg(long)]
        velocity: f64,

        /// Units of the scan velocity (e.g. "mm/s", "um/s")
        #[arg(long)]
        unit: Option<String>,

        /// Sampling rate in Hz (default from configuration)
        #[arg(long)]
        sample_rate: Option<f64>,

        /// Where to save collected data
        #[arg(long)]
        output: Option<PathBuf>,

        /// Stop the scan after this many seconds if still running
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Calibrate the axis and print the carriage position
    Position,

    /// Print scan-planning numbers for an emission band
    Plan {
        /// Highest frequency to resolve, in GHz
        #[arg(long)]
        max_frequency_ghz: f64,

        /// Sampling rate in Hz
        #[arg(long, default_value_t = 10.0)]
        sample_rate: f64,

        /// Track length for the scan-time estimate, in mm
        #[arg(long)]
        track_mm: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FtsConfig::load_from(path)?,
        None => FtsConfig::load()?,
    };
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Scan {
            velocity,
            unit,
            sample_rate,
            output,
            duration,
        } => run_scan(&config, velocity, unit, sample_rate, output, duration).await,
        Commands::Position => print_position(&config).await,
        Commands::Plan {
            max_frequency_ghz,
            sample_rate,
            track_mm,
        } => {
            print_plan(max_frequency_ghz, sample_rate, track_mm);
            Ok(())
        }
    }
}

async fn run_scan(
    config: &FtsConfig,
    velocity: f64,
    unit: Option<String>,
    sample_rate: Option<f64>,
    output: Option<PathBuf>,
    duration: Option<f64>,
) -> Result<()> {
    let bench = build_bench(config).await?;

    let encoder_reader = Arc::new(
        StreamReader::new("encoder", bench.encoder_stream.clone())
            .with_failure_threshold(config.scan.reader_failure_threshold),
    );
    let sensor_reader = Arc::new(
        StreamReader::new("sensor", bench.sensor.clone())
            .with_poll_interval(Duration::from_millis(config.sensor.poll_interval_ms))
            .with_failure_threshold(config.scan.reader_failure_threshold),
    );
    let axis = Arc::new(PositionAxis::new(
        bench.motor.clone(),
        bench.encoder_count.clone(),
        config.encoder.resolution_mm,
    ));

    println!("Moving to start position");
    axis.find_offset().await?;

    let engine = ScanEngine::new(
        bench.motor.clone(),
        encoder_reader,
        sensor_reader,
        bench.sensor_kind,
        axis,
        ScanSettings::from_config(config),
    );

    let mut scan_config = ScanConfig::new(velocity);
    scan_config.velocity_unit = unit;
    scan_config.sample_rate_hz = sample_rate.unwrap_or(config.scan.sample_rate_hz);
    scan_config.output_path = output;

    let velocity_unit = scan_config
        .velocity_unit
        .clone()
        .unwrap_or_else(|| config.motor.velocity_unit.clone());
    println!("Scanning at velocity = {velocity} {velocity_unit}");
    let path = engine.start(scan_config).await?;
    println!("Writing to {}", path.display());

    let deadline = async {
        match duration {
            Some(seconds) => tokio::time::sleep(Duration::from_secs_f64(seconds)).await,
            None => std::future::pending().await,
        }
    };

    let state = tokio::select! {
        state = engine.wait() => state,
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling scan");
            engine.stop().await?;
            engine.state()
        }
        () = deadline => {
            println!("Requested duration elapsed; stopping scan");
            engine.stop().await?;
            engine.state()
        }
    };

    let records = engine.records().map(|r| r.len()).unwrap_or(0);
    match state {
        ScanState::Stopped(outcome) => {
            println!("Scan done: {outcome:?} ({records} records)");
        }
        other => println!("Scan ended in unexpected state {other:?}"),
    }
    Ok(())
}

async fn print_position(config: &FtsConfig) -> Result<()> {
    let bench = build_bench(config).await?;
    let axis = PositionAxis::new(
        bench.motor.clone(),
        bench.encoder_count.clone(),
        config.encoder.resolution_mm,
    );

    axis.find_offset().await?;
    let position = axis.position().await?;
    println!("Carriage position: {position:.6} {}", config.motor.length_unit);
    Ok(())
}

fn print_plan(max_frequency_ghz: f64, sample_rate: f64, track_mm: Option<f64>) {
    let velocity = optics::mirror_velocity_mm_s(sample_rate, max_frequency_ghz, 1.0);
    println!("Band up to {max_frequency_ghz} GHz, sampled at {sample_rate} Hz:");
    println!(
        "  wavelength:      {:.6} mm",
        optics::wavelength_mm(max_frequency_ghz)
    );
    println!(
        "  OPD increment:   {:.6} mm",
        optics::opd_increment_mm(max_frequency_ghz)
    );
    println!("  mirror velocity: {velocity:.6} mm/s");
    println!(
        "  fringe freq:     {:.3} Hz",
        optics::fringe_frequency_hz(sample_rate)
    );
    if let Some(track) = track_mm {
        println!(
            "  scan time:       {:.1} s over {track} mm",
            optics::scan_time_s(track, velocity)
        );
    }
}
