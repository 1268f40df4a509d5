use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use tofcore::simulation::synthetic::{simulate_events, SimulationConfig};
use tofcore::{TofError, TofResult};
use tofdf::config::AnalysisConfig;
use tofdf::data::io::{load_measurements, save_measurements, write_calibrated_csv, write_measurements_csv};
use tofdf::data::raw::{load_events, save_events, EventFormat};
use tofdf::logging::{init_logging, LogFormat, LogLevel};
use tofdf::run::{AnalysisRun, RunReport};

#[derive(Parser)]
#[command(name = "tofdf", version, about = "Coincidence decoding and mass calibration of time-of-flight detectors")]
struct Cli {
    /// JSON analysis configuration; built-in defaults if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

/// Overrides applied on top of the configuration file.
#[derive(Args, Clone, Debug, Default)]
struct Overrides {
    /// Number of detector channels
    #[arg(long)]
    detectors: Option<usize>,

    /// Flight path between reference timer and detectors in mm
    #[arg(long)]
    flight_path: Option<f64>,
}

#[derive(Subcommand)]
enum Command {
    /// Decode raw events into per-detector measurement tables
    Decode {
        #[arg(short, long)]
        input: PathBuf,
        /// Measurement file (.json, .bin or .zst)
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum)]
        format: Option<EventFormat>,
        /// Also write a flat CSV of all measurements
        #[arg(long)]
        csv: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Calibrate decoded measurement tables
    Calibrate {
        /// Measurement file written by `decode`
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Decode and calibrate in one pass
    Run {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[arg(long, value_enum)]
        format: Option<EventFormat>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Write synthetic events with a known detector response
    Simulate {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short = 'n', long, default_value_t = 100_000)]
        events: usize,
        /// Random seed; drawn at random if omitted
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum)]
        format: Option<EventFormat>,
        #[arg(long, default_value_t = 0.0)]
        missing_role_probability: f64,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the effective configuration as JSON
    Config {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli, overrides: Option<&Overrides>) -> TofResult<AnalysisConfig> {
    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(o) = overrides {
        if let Some(n) = o.detectors {
            config.detector_count = n;
        }
        if let Some(l) = o.flight_path {
            config.flight_path_mm = l;
        }
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    config.validate()?;
    Ok(config)
}

fn write_outputs(dir: &Path, config: &AnalysisConfig, report: &RunReport) -> TofResult<()> {
    fs::create_dir_all(dir)?;

    let csv_path = dir.join("calibrated.csv");
    let rows = write_calibrated_csv(
        BufWriter::new(File::create(&csv_path)?),
        report.calibrated().map(|c| (c.detector_index, c.events.as_slice())),
    )?;

    let summary_path = dir.join("calibration.json");
    let writer = BufWriter::new(File::create(&summary_path)?);
    serde_json::to_writer_pretty(writer, &report.summary(config)).map_err(|e| TofError::Serialization(e.to_string()))?;

    info!(rows, csv = %csv_path.display(), summary = %summary_path.display(), "wrote calibration outputs");
    Ok(())
}

fn execute(cli: &Cli) -> TofResult<()> {
    let overrides = match &cli.command {
        Command::Decode { overrides, .. }
        | Command::Calibrate { overrides, .. }
        | Command::Run { overrides, .. }
        | Command::Simulate { overrides, .. } => Some(overrides),
        Command::Config { .. } => None,
    };
    let config = load_config(cli, overrides)?;
    init_logging(&config.log);

    match &cli.command {
        Command::Decode { input, output, format, csv, .. } => {
            let (events, skipped) = load_events(input, *format)?;
            let run = AnalysisRun::new(&config)?;
            let (set, stats) = run.decode(&events);
            save_measurements(output, &set)?;
            if let Some(csv) = csv {
                write_measurements_csv(BufWriter::new(File::create(csv)?), &set, config.position_per_time)?;
            }
            info!(skipped, measurements = stats.measurements, output = %output.display(), "decode finished");
        }
        Command::Calibrate { input, output_dir, .. } => {
            let set = load_measurements(input)?;
            if set.detector_count() != config.detector_count {
                return Err(TofError::InvalidConfig(format!(
                    "measurement file holds {} detectors, configuration expects {}",
                    set.detector_count(),
                    config.detector_count
                )));
            }
            let run = AnalysisRun::new(&config)?;
            let outcomes = run.calibrate(&set);
            let stats = Default::default();
            write_outputs(output_dir, &config, &RunReport { stats, outcomes })?;
        }
        Command::Run { input, output_dir, format, .. } => {
            let (events, _) = load_events(input, *format)?;
            let report = AnalysisRun::new(&config)?.execute(&events);
            write_outputs(output_dir, &config, &report)?;
        }
        Command::Simulate { output, events, seed, format, missing_role_probability, .. } => {
            let sim = SimulationConfig {
                roles: config.roles,
                detector_count: config.detector_count,
                tick_to_ns: config.tick_to_ns,
                flight_path_mm: config.flight_path_mm,
                missing_role_probability: *missing_role_probability,
                seed: seed.unwrap_or_else(rand::random),
                ..Default::default()
            };
            let seed = sim.seed;
            let (generated, _) = simulate_events(sim, *events)?;
            save_events(output, &generated, *format)?;
            info!(events = generated.len(), seed, output = %output.display(), "simulation written");
        }
        Command::Config { output } => {
            let json = config.to_json()?;
            match output {
                Some(path) => fs::write(path, json)?,
                None => writeln!(io::stdout(), "{}", json)?,
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tofdf failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
