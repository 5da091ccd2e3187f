//! Iteration controller.
//!
//! Runs iterations one after another, each with a fresh scheduler and a
//! fresh strategy seeded from the master seed, and stops at the first
//! violation. Inconclusive iterations are counted and skipped.

use std::{fmt, future::Future};

use crate::{
    checker::Violation,
    config::ExplorationConfig,
    error::{ConfigError, EngineError, ReplayMismatch},
    operation::OperationResult,
    runtime::{Context, IterationOutcome, run_iteration},
    strategy::{ReplayStrategy, StrategyFactory, iteration_seed},
    trace::{TRACE_FORMAT_VERSION, Trace, TraceArtifact},
};

/// A violation together with everything needed to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    /// Strategy that found it.
    pub strategy: String,
    /// Master seed of the exploration.
    pub master_seed: u64,
    /// Zero-based index of the failing iteration.
    pub iteration: u64,
    /// Seed of the failing iteration.
    pub seed: u64,
    /// What went wrong.
    pub violation: Violation,
    /// Decisions leading to the violation.
    pub trace: Trace,
}

impl BugReport {
    /// Persistable form of this report.
    pub fn artifact(&self) -> TraceArtifact {
        TraceArtifact {
            version: TRACE_FORMAT_VERSION,
            strategy: self.strategy.clone(),
            master_seed: self.master_seed,
            iteration: self.iteration,
            iteration_seed: self.seed,
            scenario: None,
            violation: Some(self.violation.clone()),
            trace: self.trace.clone(),
        }
    }
}

/// Final verdict of an exploration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The budget ran out (or the schedule space was exhausted) without a
    /// violation.
    NoViolationFound,
    /// A violation was found and exploration stopped.
    ViolationFound(Box<BugReport>),
    /// A replayed trace no longer matches the program.
    ReplayMismatch(ReplayMismatch),
}

/// Summary of an exploration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationReport {
    /// Strategy name.
    pub strategy: String,
    /// Master seed.
    pub master_seed: u64,
    /// Iterations run, including the failing one.
    pub iterations: u64,
    /// Iterations that completed without a violation.
    pub passed: u64,
    /// Iterations abandoned at the step bound.
    pub inconclusive: u64,
    /// Whether the strategy ran out of schedules before the budget did.
    pub exhausted: bool,
    /// Outcome.
    pub verdict: Verdict,
}

impl ExplorationReport {
    /// The bug found, if any.
    pub fn bug(&self) -> Option<&BugReport> {
        match &self.verdict {
            Verdict::ViolationFound(bug) => Some(bug),
            _ => None,
        }
    }

    /// Whether no violation was found and no replay diverged.
    pub fn is_clean(&self) -> bool {
        self.verdict == Verdict::NoViolationFound
    }
}

impl fmt::Display for ExplorationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "strategy:     {} (master seed {})", self.strategy, self.master_seed)?;
        write!(
            f,
            "iterations:   {} ({} passed, {} inconclusive)",
            self.iterations, self.passed, self.inconclusive
        )?;
        if self.exhausted {
            write!(f, ", schedule space exhausted")?;
        }
        writeln!(f)?;

        match &self.verdict {
            Verdict::NoViolationFound => write!(f, "verdict:      no violation found"),
            Verdict::ReplayMismatch(mismatch) => {
                write!(f, "verdict:      replay mismatch: {mismatch}")
            },
            Verdict::ViolationFound(bug) => {
                writeln!(f, "verdict:      {}", bug.violation.kind())?;
                writeln!(f, "  {}", bug.violation)?;
                writeln!(f, "  iteration {} (seed {:#018x})", bug.iteration, bug.seed)?;
                writeln!(
                    f,
                    "  trace: {} decisions, {} preemptions",
                    bug.trace.len(),
                    bug.trace.preemptions()
                )?;
                let schedule: Vec<String> =
                    bug.trace.schedule().iter().map(ToString::to_string).collect();
                write!(f, "  schedule: {}", schedule.join(" "))
            },
        }
    }
}

/// Result of replaying one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The run followed the trace and ended in a violation.
    Reproduced {
        /// Violation observed.
        violation: Violation,
        /// Trace of the replayed run, identical to the input on success.
        trace: Trace,
    },
    /// The run followed the trace and no violation occurred.
    NotReproduced,
    /// The program no longer follows the trace.
    Mismatch(ReplayMismatch),
}

/// Drives exploration runs with a validated configuration.
#[derive(Debug, Clone)]
pub struct Explorer {
    config: ExplorationConfig,
}

impl Explorer {
    /// Explorer for `config`.
    pub fn new(config: ExplorationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use.
    pub fn config(&self) -> &ExplorationConfig {
        &self.config
    }

    /// Explore `entry` with the configured strategy, or replay the
    /// configured trace if one is set.
    pub fn explore<F, Fut>(&self, entry: F) -> Result<ExplorationReport, EngineError>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = OperationResult> + 'static,
    {
        if let Some(trace) = &self.config.replay {
            return self.replay_report(entry, trace);
        }

        let mut factory = self.config.strategy.factory();
        self.explore_with(entry, factory.as_mut())
    }

    /// Explore `entry` with strategies from `factory`.
    pub fn explore_with<F, Fut>(
        &self,
        entry: F,
        factory: &mut dyn StrategyFactory,
    ) -> Result<ExplorationReport, EngineError>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = OperationResult> + 'static,
    {
        let config = &self.config;
        tracing::info!(
            strategy = factory.name(),
            seed = config.seed,
            iterations = config.iterations,
            max_steps = config.max_steps,
            "exploration started"
        );

        let mut report = ExplorationReport {
            strategy: factory.name().to_string(),
            master_seed: config.seed,
            iterations: 0,
            passed: 0,
            inconclusive: 0,
            exhausted: false,
            verdict: Verdict::NoViolationFound,
        };

        for iteration in 0..config.iterations {
            if factory.is_exhausted() {
                break;
            }

            let seed = iteration_seed(config.seed, iteration);
            let strategy = factory.create(iteration, seed);
            let result = run_iteration(&entry, strategy, config.max_steps, iteration)?;
            factory.iteration_finished(&result.trace, &result.outcome);
            report.iterations += 1;

            tracing::debug!(
                iteration,
                seed,
                steps = result.steps,
                outcome = result.outcome.label(),
                "iteration finished"
            );

            match result.outcome {
                IterationOutcome::Passed => report.passed += 1,
                IterationOutcome::StepBudgetExceeded { steps } => {
                    tracing::warn!(
                        iteration,
                        seed,
                        steps,
                        "iteration inconclusive: step bound reached"
                    );
                    report.inconclusive += 1;
                },
                IterationOutcome::Violation(violation) => {
                    tracing::info!(iteration, seed, %violation, "violation found");
                    report.verdict = Verdict::ViolationFound(Box::new(BugReport {
                        strategy: report.strategy.clone(),
                        master_seed: config.seed,
                        iteration,
                        seed,
                        violation,
                        trace: result.trace,
                    }));
                    return Ok(report);
                },
                IterationOutcome::ReplayMismatch(mismatch) => {
                    tracing::warn!(iteration, %mismatch, "replay mismatch");
                    report.verdict = Verdict::ReplayMismatch(mismatch);
                    return Ok(report);
                },
            }
        }

        report.exhausted = factory.is_exhausted();
        tracing::info!(
            iterations = report.iterations,
            passed = report.passed,
            inconclusive = report.inconclusive,
            exhausted = report.exhausted,
            "exploration finished without violation"
        );
        Ok(report)
    }

    /// Re-run `entry` following `trace` exactly.
    ///
    /// The step bound is one more than the trace length, so a program that
    /// runs past the trace is reported as a mismatch rather than as
    /// inconclusive.
    pub fn replay<F, Fut>(&self, entry: F, trace: &Trace) -> Result<ReplayOutcome, EngineError>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = OperationResult> + 'static,
    {
        tracing::info!(decisions = trace.len(), "replaying trace");

        let strategy = Box::new(ReplayStrategy::new(trace.clone()));
        let max_steps = trace.len() as u64 + 1;
        let result = run_iteration(&entry, strategy, max_steps, 0)?;

        let outcome = match result.outcome {
            IterationOutcome::Violation(violation) => {
                tracing::info!(%violation, "violation reproduced");
                ReplayOutcome::Reproduced { violation, trace: result.trace }
            },
            IterationOutcome::Passed => {
                tracing::info!("trace replayed without violation");
                ReplayOutcome::NotReproduced
            },
            IterationOutcome::ReplayMismatch(mismatch) => {
                tracing::warn!(%mismatch, "replay mismatch");
                ReplayOutcome::Mismatch(mismatch)
            },
            IterationOutcome::StepBudgetExceeded { steps } => {
                tracing::warn!(steps, "replay ran past the trace");
                ReplayOutcome::Mismatch(ReplayMismatch::TraceExhausted { step: steps })
            },
        };
        Ok(outcome)
    }

    fn replay_report<F, Fut>(
        &self,
        entry: F,
        trace: &Trace,
    ) -> Result<ExplorationReport, EngineError>
    where
        F: Fn(Context) -> Fut,
        Fut: Future<Output = OperationResult> + 'static,
    {
        let mut report = ExplorationReport {
            strategy: "replay".to_string(),
            master_seed: self.config.seed,
            iterations: 1,
            passed: 0,
            inconclusive: 0,
            exhausted: false,
            verdict: Verdict::NoViolationFound,
        };

        match self.replay(entry, trace)? {
            ReplayOutcome::Reproduced { violation, trace } => {
                report.verdict = Verdict::ViolationFound(Box::new(BugReport {
                    strategy: report.strategy.clone(),
                    master_seed: self.config.seed,
                    iteration: 0,
                    seed: 0,
                    violation,
                    trace,
                }));
            },
            ReplayOutcome::NotReproduced => report.passed = 1,
            ReplayOutcome::Mismatch(mismatch) => report.verdict = Verdict::ReplayMismatch(mismatch),
        }
        Ok(report)
    }
}
