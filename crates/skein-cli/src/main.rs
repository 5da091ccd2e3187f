//! Skein command-line driver.
//!
//! # Usage
//!
//! ```bash
//! # List built-in scenarios
//! skein list
//!
//! # Search for a bug and keep the failing trace
//! skein explore --scenario counter-race --strategy priority --iterations 500 --save-trace bug.cbor
//!
//! # Reproduce it
//! skein replay --scenario counter-race --trace bug.cbor
//! ```
//!
//! Exit status is 0 when nothing was found, 3 when a violation was found or
//! reproduced, and 4 when a replayed trace no longer matches the program.

mod error;

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand, ValueEnum};
use error::CliError;
use skein_core::{
    DEFAULT_ITERATIONS, DEFAULT_MAX_STEPS, ExplorationConfig, Explorer, ReplayOutcome,
    StrategyKind, TraceArtifact, Verdict,
};
use skein_harness::Scenario;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_VIOLATION: u8 = 3;
const EXIT_MISMATCH: u8 = 4;

/// Systematic concurrency testing
#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(about = "Explore the interleavings of concurrent scenarios")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List built-in scenarios
    List,

    /// Explore a scenario's schedules looking for a violation
    Explore {
        /// Scenario name
        #[arg(short, long)]
        scenario: Scenario,

        /// Search strategy
        #[arg(long, value_enum, default_value_t = StrategyArg::Random)]
        strategy: StrategyArg,

        /// Priority change points per iteration (priority strategy only)
        #[arg(long, default_value = "2")]
        change_points: u32,

        /// Iterations to run
        #[arg(short, long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u64,

        /// Decisions per iteration before it is abandoned
        #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
        max_steps: u64,

        /// Master seed (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Write the failing trace here
        #[arg(long)]
        save_trace: Option<PathBuf>,
    },

    /// Replay a saved trace against a scenario
    Replay {
        /// Scenario name
        #[arg(short, long)]
        scenario: Scenario,

        /// Trace file written by `explore --save-trace`
        #[arg(short, long)]
        trace: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum StrategyArg {
    Random,
    RoundRobin,
    Priority,
    Guided,
    Exhaustive,
}

impl StrategyArg {
    fn kind(self, change_points: u32) -> StrategyKind {
        match self {
            Self::Random => StrategyKind::Random,
            Self::RoundRobin => StrategyKind::RoundRobin,
            Self::Priority => StrategyKind::Priority { change_points },
            Self::Guided => StrategyKind::Guided,
            Self::Exhaustive => StrategyKind::Exhaustive,
        }
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    let mut out = io::stdout().lock();
    match args.command {
        Command::List => list(&mut out),
        Command::Explore {
            scenario,
            strategy,
            change_points,
            iterations,
            max_steps,
            seed,
            save_trace,
        } => {
            let seed = match seed {
                Some(seed) => seed,
                None => random_seed()?,
            };
            let config = ExplorationConfig::default()
                .with_strategy(strategy.kind(change_points))
                .with_iterations(iterations)
                .with_max_steps(max_steps)
                .with_seed(seed);
            explore(&mut out, scenario, config, save_trace)
        },
        Command::Replay { scenario, trace } => replay(&mut out, scenario, trace),
    }
}

fn random_seed() -> Result<u64, getrandom::Error> {
    let mut buf = [0u8; 8];
    getrandom::fill(&mut buf)?;
    let seed = u64::from_le_bytes(buf);
    tracing::info!(seed, "no seed given, picked one");
    Ok(seed)
}

fn list(out: &mut impl Write) -> Result<ExitCode, Box<dyn std::error::Error>> {
    for scenario in Scenario::ALL {
        let tag = if scenario.is_buggy() { "buggy" } else { "fixed" };
        writeln!(out, "{:<18} {tag}  {}", scenario.name(), scenario.description())?;
    }
    Ok(ExitCode::SUCCESS)
}

fn explore(
    out: &mut impl Write,
    scenario: Scenario,
    config: ExplorationConfig,
    save_trace: Option<PathBuf>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing::info!(%scenario, strategy = ?config.strategy, seed = config.seed, "exploring");

    let explorer = Explorer::new(config)?;
    let report = scenario.explore(&explorer)?;
    writeln!(out, "scenario:     {scenario}")?;
    writeln!(out, "{report}")?;

    match &report.verdict {
        Verdict::NoViolationFound => {
            if save_trace.is_some() {
                tracing::info!("no violation found, no trace written");
            }
            Ok(ExitCode::SUCCESS)
        },
        Verdict::ViolationFound(bug) => {
            if let Some(path) = save_trace {
                bug.artifact().with_scenario(scenario.name()).save(&path)?;
                writeln!(out, "trace saved to {}", path.display())?;
            }
            Ok(ExitCode::from(EXIT_VIOLATION))
        },
        Verdict::ReplayMismatch(_) => Ok(ExitCode::from(EXIT_MISMATCH)),
    }
}

fn replay(
    out: &mut impl Write,
    scenario: Scenario,
    path: PathBuf,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let artifact = TraceArtifact::load(&path)?;
    if let Some(recorded) = &artifact.scenario
        && recorded != scenario.name()
    {
        return Err(CliError::ScenarioMismatch {
            recorded: recorded.clone(),
            requested: scenario.name().to_string(),
        }
        .into());
    }
    tracing::info!(
        %scenario,
        strategy = %artifact.strategy,
        iteration = artifact.iteration,
        decisions = artifact.trace.len(),
        "replaying"
    );

    let explorer = Explorer::new(ExplorationConfig::default())?;
    match scenario.replay(&explorer, &artifact.trace)? {
        ReplayOutcome::Reproduced { violation, trace } => {
            if artifact.violation.as_ref() != Some(&violation) {
                tracing::warn!(recorded = ?artifact.violation, "reproduced a different violation");
            }
            writeln!(out, "reproduced:   {}", violation.kind())?;
            writeln!(out, "  {violation}")?;
            let preemptions = trace.preemptions();
            writeln!(out, "  trace: {} decisions, {preemptions} preemptions", trace.len())?;
            Ok(ExitCode::from(EXIT_VIOLATION))
        },
        ReplayOutcome::NotReproduced => {
            writeln!(out, "not reproduced: the trace ran to completion without a violation")?;
            Ok(ExitCode::SUCCESS)
        },
        ReplayOutcome::Mismatch(mismatch) => {
            writeln!(out, "replay mismatch: {mismatch}")?;
            Ok(ExitCode::from(EXIT_MISMATCH))
        },
    }
}
