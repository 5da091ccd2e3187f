//! Engine error types.

use thiserror::Error;

use crate::{
    operation::{LockId, OperationId},
    trace::ChoiceKind,
};

/// Invalid exploration configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// At least one iteration is required.
    #[error("iteration count must be at least 1")]
    ZeroIterations,

    /// A step bound of zero would abort every iteration immediately.
    #[error("max steps per iteration must be at least 1")]
    ZeroMaxSteps,

    /// Priority strategy with no priority switches at all.
    #[error("priority strategy needs at least 1 change point, got {0}")]
    InvalidChangePoints(u32),
}

/// Errors that indicate a bug in the engine or its configuration, as opposed
/// to a bug found in the program under test.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A strategy chose an operation outside the enabled set.
    #[error("strategy {strategy} chose {chosen} at step {step}, not enabled ({enabled:?})")]
    InvalidChoice {
        /// Strategy name.
        strategy: &'static str,
        /// Step at which the choice was made.
        step: u64,
        /// Offending choice.
        chosen: OperationId,
        /// Enabled set passed to the strategy.
        enabled: Vec<OperationId>,
    },
}

/// A stored trace no longer reproduces its recorded decision sequence.
///
/// Distinct from a passing replay: a mismatch means the program changed,
/// not that the original bug is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayMismatch {
    /// The recorded operation is not enabled at this step.
    #[error("step {step}: recorded {expected} is not enabled (enabled: {enabled:?})")]
    NotEnabled {
        /// Step index.
        step: u64,
        /// Operation the trace recorded.
        expected: OperationId,
        /// Live enabled set.
        enabled: Vec<OperationId>,
    },

    /// The live enabled set differs from the recorded snapshot.
    #[error("step {step}: enabled set diverged (recorded {recorded:?}, live {live:?})")]
    EnabledSetDiverged {
        /// Step index.
        step: u64,
        /// Snapshot from the trace.
        recorded: Vec<OperationId>,
        /// Live enabled set.
        live: Vec<OperationId>,
    },

    /// A nondeterministic choice was requested that the trace does not hold.
    #[error("step {step}: expected {expected:?} choice, program asked for {actual:?}")]
    ChoiceDiverged {
        /// Step index.
        step: u64,
        /// Next recorded choice kind, if any.
        expected: Option<ChoiceKind>,
        /// Choice kind requested by the program.
        actual: ChoiceKind,
    },

    /// The program made fewer choices during a step than were recorded.
    #[error("step {step}: recorded {unused:?} choice was never requested")]
    UnusedChoices {
        /// Step index.
        step: u64,
        /// Kind of the first unconsumed choice.
        unused: ChoiceKind,
    },

    /// The program kept running after the last recorded decision.
    #[error("trace exhausted at step {step} while operations were still enabled")]
    TraceExhausted {
        /// Step index.
        step: u64,
    },

    /// The iteration finished before consuming every recorded decision.
    #[error("iteration ended after {consumed} of {recorded} recorded decisions")]
    TraceNotConsumed {
        /// Decisions replayed.
        consumed: u64,
        /// Decisions in the trace.
        recorded: u64,
    },
}

/// Errors reading or writing persisted traces.
#[derive(Debug, Error)]
pub enum TraceError {
    /// CBOR encoding failed.
    #[error("failed to encode trace: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("failed to decode trace: {0}")]
    Decode(String),

    /// Trace written by an incompatible version.
    #[error("unsupported trace format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u16,
        /// Version this build reads.
        expected: u16,
    },

    /// Filesystem error.
    #[error("trace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Misuse of a [`ResourceLock`](crate::ResourceLock).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The calling operation does not hold the lock it tried to release.
    #[error("{operation} released {lock} without holding it (held by {holder:?})")]
    NotHeld {
        /// Lock being released.
        lock: LockId,
        /// Caller.
        operation: OperationId,
        /// Actual holder.
        holder: Option<OperationId>,
    },
}

/// A user assertion evaluated to false.
///
/// The violation is recorded with the scheduler as soon as the assertion
/// fails; returning this error with `?` merely unwinds the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("assertion failed in {operation}: {message}")]
pub struct AssertionFailed {
    /// Operation that evaluated the assertion.
    pub operation: OperationId,
    /// User message.
    pub message: String,
}
