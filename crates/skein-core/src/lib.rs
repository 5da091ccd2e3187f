//! Systematic concurrency testing.
//!
//! Concurrent work is written as operations against a [`Context`]. Instead
//! of letting a runtime interleave them by chance, the engine runs exactly
//! one operation at a time and lets a [`Strategy`] pick who continues at
//! every scheduling point. Each run (an iteration) is recorded as a
//! [`Trace`]; a failing trace replays the same interleaving on demand.
//!
//! # Architecture
//!
//! - [`runtime`]: operations, scheduling points, locks and the execution
//!   controller that polls one operation per step.
//! - [`strategy`]: pluggable decision procedures (random, round-robin,
//!   priority, guided, exhaustive, replay).
//! - [`trace`]: decision log and its persisted, versioned form.
//! - [`checker`]: assertions, invariants and fault capture.
//! - [`Explorer`]: runs iterations until a violation or the budget.
//!
//! Only interleavings around scheduling points are explored. Code between
//! two scheduling points of one operation is always observed as one atomic
//! unit.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checker;
pub mod config;
pub mod error;
pub mod explorer;
pub mod operation;
pub mod runtime;
pub mod strategy;
pub mod trace;

pub use checker::{BlockedOperation, Violation};
pub use config::{DEFAULT_ITERATIONS, DEFAULT_MAX_STEPS, ExplorationConfig};
pub use error::{AssertionFailed, ConfigError, EngineError, LockError, ReplayMismatch, TraceError};
pub use explorer::{BugReport, ExplorationReport, Explorer, ReplayOutcome, Verdict};
pub use operation::{
    Fault, LockId, OperationHandle, OperationId, OperationResult, OperationState, WaitTarget,
};
pub use runtime::{
    Context, IterationOutcome, IterationResult, PointKind, ResourceLock, run_iteration,
};
pub use strategy::{Strategy, StrategyFactory, StrategyKind, iteration_seed};
pub use trace::{Choice, ChoiceKind, Decision, TRACE_FORMAT_VERSION, Trace, TraceArtifact};
