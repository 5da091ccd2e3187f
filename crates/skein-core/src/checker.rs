//! Invariant and fault checking.
//!
//! Turns failed assertions, broken invariants, deadlocks and faults escaping
//! an operation into [`Violation`]s tied to the current trace.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
};

use serde::{Deserialize, Serialize};

use crate::operation::{OperationId, WaitTarget};

/// A bug found in the program under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    /// A user assertion or registered invariant evaluated to false.
    AssertionViolation {
        /// Operation whose step exposed the violation.
        operation: OperationId,
        /// User message.
        message: String,
    },

    /// No operation is enabled while some have not completed.
    DeadlockDetected {
        /// Every unfinished operation and what it waits on.
        blocked: Vec<BlockedOperation>,
    },

    /// An error or panic escaped an operation.
    UnhandledOperationFault {
        /// Faulting operation.
        operation: OperationId,
        /// Rendered error or panic payload.
        message: String,
    },
}

impl Violation {
    /// Short, stable name of the violation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AssertionViolation { .. } => "AssertionViolation",
            Self::DeadlockDetected { .. } => "DeadlockDetected",
            Self::UnhandledOperationFault { .. } => "UnhandledOperationFault",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AssertionViolation { operation, message } => {
                write!(f, "assertion violation in {operation}: {message}")
            },
            Self::DeadlockDetected { blocked } => {
                write!(f, "deadlock detected:")?;
                for entry in blocked {
                    match entry.waits_on {
                        Some(target) => write!(f, " {} waits on {target};", entry.operation)?,
                        None => write!(f, " {} is stuck;", entry.operation)?,
                    }
                }
                Ok(())
            },
            Self::UnhandledOperationFault { operation, message } => {
                write!(f, "unhandled fault in {operation}: {message}")
            },
        }
    }
}

/// An operation that could not make progress when a deadlock was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedOperation {
    /// Operation id.
    pub operation: OperationId,
    /// What it waits on.
    pub waits_on: Option<WaitTarget>,
}

type Check = Box<dyn Fn() -> Result<(), String>>;

struct Invariant {
    name: String,
    check: Check,
}

/// Global invariants evaluated after every step.
#[derive(Default)]
pub(crate) struct InvariantSet {
    invariants: Vec<Invariant>,
}

impl InvariantSet {
    pub(crate) fn register(&mut self, name: String, check: Check) {
        self.invariants.push(Invariant { name, check });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Check every invariant; the first failure wins. A check that panics
    /// counts as failed.
    pub(crate) fn check(&self, after: OperationId) -> Option<Violation> {
        self.invariants.iter().find_map(|inv| {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| (inv.check)())) {
                Ok(Ok(())) => return None,
                Ok(Err(reason)) => format!("invariant '{}' violated: {reason}", inv.name),
                Err(payload) => {
                    format!("invariant '{}' {}", inv.name, panic_message(payload.as_ref()))
                },
            };
            Some(Violation::AssertionViolation { operation: after, message })
        })
    }
}

/// Render a panic payload caught from an operation.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}
