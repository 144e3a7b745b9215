use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mapkit_scheduler::SchedulerConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

mod scenarios;

pub use scenarios::{Replay, Scenario};

#[derive(Debug, Parser)]
#[command(name = "mapkit-sched")]
#[command(about = "MapKit task scheduler CLI")]
pub struct Cli {
    /// Log scheduler decisions to stderr (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a scheduling scenario and print the recorded events as JSON.
    Scenario {
        #[arg(value_enum, value_name = "NAME")]
        name: Scenario,
    },
    /// Print the effective scheduler configuration as JSON.
    Config {
        /// Read `key = value` settings from a file instead of the environment.
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Scenario { name } => run_scenario(name),
        Commands::Config { file } => run_config(file.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Install a stderr subscriber; `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "mapkit_scheduler=debug",
        _ => "mapkit_scheduler=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .with_filter(filter);

    // Already installed when `run` is called more than once in-process
    let _ = Registry::default().with(layer).try_init();
}

fn run_scenario(scenario: Scenario) -> Result<()> {
    let replay = scenario
        .replay()
        .with_context(|| format!("scenario {scenario:?} failed"))?;

    let json = serde_json::to_string_pretty(&replay)?;
    println!("{json}");

    Ok(())
}

fn run_config(file: Option<&Path>) -> Result<()> {
    let config = match file {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SchedulerConfig::from_env().context("invalid scheduler environment")?,
    };
    config.warn_on_unsliced();

    let json = serde_json::to_string_pretty(&config)?;
    println!("{json}");

    Ok(())
}
