//! encrel CLI
//!
//! Runs encoder reliability suites against the simulated platform.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use encoder_reliability::scenario::ScenarioSuite;
use encoder_reliability::sim::{SimConfig, SimPlatform};
use encoder_reliability::test_runner::{TestConfig, TestRunner};
use encoder_reliability::VERSION;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "encrel")]
#[command(author, version, about = "Declarative video encoder reliability runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a suite and print the report
    Run {
        /// Suite file (defaults to the built-in suite)
        #[arg(long, value_name = "FILE")]
        suite: Option<PathBuf>,
        /// Runner config file (JSON)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Simulated platform config file (JSON)
        #[arg(long, value_name = "FILE")]
        sim_config: Option<PathBuf>,
        /// Only run cases whose name matches this regex
        #[arg(short, long, value_name = "RE")]
        filter: Option<String>,
        /// Directory for encoded output files
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
        /// Per-case timeout in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        /// Pause before every case in milliseconds
        #[arg(long, value_name = "MS")]
        settle_ms: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the cases of a suite
    List {
        /// Suite file (defaults to the built-in suite)
        #[arg(long, value_name = "FILE")]
        suite: Option<PathBuf>,
    },

    /// Show the step program of one case
    Show {
        /// Case name
        case: String,
        /// Suite file (defaults to the built-in suite)
        #[arg(long, value_name = "FILE")]
        suite: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            suite,
            config,
            sim_config,
            filter,
            output_dir,
            timeout_ms,
            settle_ms,
            json,
        } => {
            let overrides = Overrides {
                filter,
                output_dir,
                timeout_ms,
                settle_ms,
                verbose: cli.verbose > 0,
            };
            run_suite(suite.as_deref(), config.as_deref(), sim_config.as_deref(), overrides, json)
        }
        Commands::List { suite } => list_cases(suite.as_deref()),
        Commands::Show { case, suite } => show_case(&case, suite.as_deref()),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("\x1b[31mError: {:#}\x1b[0m", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn", // Default: warnings and errors
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct Overrides {
    filter: Option<String>,
    output_dir: Option<PathBuf>,
    timeout_ms: Option<u64>,
    settle_ms: Option<u64>,
    verbose: bool,
}

fn load_suite(path: Option<&Path>) -> anyhow::Result<ScenarioSuite> {
    match path {
        Some(path) => ScenarioSuite::load(path)
            .with_context(|| format!("loading suite '{}'", path.display())),
        None => ScenarioSuite::builtin().context("loading the built-in suite"),
    }
}

fn run_suite(
    suite: Option<&Path>,
    config: Option<&Path>,
    sim_config: Option<&Path>,
    overrides: Overrides,
    json: bool,
) -> anyhow::Result<bool> {
    let suite = load_suite(suite)?;

    let mut config = match config {
        Some(path) => TestConfig::load(path)
            .with_context(|| format!("loading config '{}'", path.display()))?,
        None => TestConfig::default(),
    };
    if overrides.filter.is_some() {
        config.filter = overrides.filter;
    }
    if overrides.output_dir.is_some() {
        config.output_dir = overrides.output_dir;
    }
    if let Some(ms) = overrides.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = overrides.settle_ms {
        config.settle_delay = Duration::from_millis(ms);
    }
    config.verbose |= overrides.verbose;

    let sim_config = match sim_config {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading sim config '{}'", path.display()))?;
            serde_json::from_str::<SimConfig>(&source)
                .with_context(|| format!("parsing sim config '{}'", path.display()))?
        }
        None => SimConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting the async runtime")?;

    let platform = Arc::new(SimPlatform::new(sim_config));
    let mut runner = TestRunner::with_platform(config, platform);
    runner.add_suite(suite);
    let report = runtime.block_on(runner.run_all())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(report.is_success())
}

fn list_cases(suite: Option<&Path>) -> anyhow::Result<bool> {
    let suite = load_suite(suite)?;
    println!("{} (encrel {})", suite.name, VERSION);
    if !suite.description.is_empty() {
        println!("  {}", suite.description);
    }
    for scenario in &suite.scenarios {
        println!("  {:<28} {}", scenario.name, scenario.label());
    }
    println!("{} cases", suite.len());
    Ok(true)
}

fn show_case(case: &str, suite: Option<&Path>) -> anyhow::Result<bool> {
    let suite = load_suite(suite)?;
    let Some(scenario) = suite.find(case) else {
        bail!("no case named '{}' in suite '{}'", case, suite.name);
    };
    let program = scenario.program();
    println!("{}  {}", scenario.name, scenario.label());
    println!("  encoder:     {}", scenario.encoder);
    println!("  frame_total: {}", scenario.frame_total);
    println!("  iterations:  {}", scenario.iterations);
    if scenario.workdone_at_eos {
        println!("  finishes at end of stream");
    }
    if scenario.flush_at_eos {
        println!("  finishes after a flush");
    }
    println!("  steps ({}):", program.len());
    for (i, step) in program.steps().iter().enumerate() {
        println!("    {:>3}  {}", i, step);
    }
    Ok(true)
}
