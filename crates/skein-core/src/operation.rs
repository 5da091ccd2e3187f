//! Operations: the schedulable units of concurrent work.
//!
//! An operation owns its continuation (the remaining work, captured as a
//! pinned future) and a lifecycle state. Operations are never destroyed
//! mid-iteration; the whole table is dropped when the iteration ends.

use std::{fmt, future::Future, pin::Pin};

use serde::{Deserialize, Serialize};

/// Error type operation bodies may return.
///
/// Anything escaping an operation's continuation is reported as an
/// unhandled operation fault.
pub type Fault = Box<dyn std::error::Error>;

/// Result of running an operation to completion.
pub type OperationResult = Result<(), Fault>;

/// Remaining work of an operation, resumed at its next scheduling point.
pub type Continuation = Pin<Box<dyn Future<Output = OperationResult>>>;

/// Identifier of an operation, unique and stable within one iteration.
///
/// Ids are assigned in spawn order starting at 0 (the entry point), so the
/// same program under the same decisions always yields the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Id of the operation running the test entry point.
    pub const ROOT: Self = Self(0);

    /// Create an id from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Identifier of a [`ResourceLock`](crate::ResourceLock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(u32);

impl LockId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock{}", self.0)
    }
}

/// Lifecycle of an operation.
///
/// ```text
/// Created -> Enabled <-> Running -> Completed | Faulted
///               ^           |
///               +- Blocked <+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    /// Spawned but not yet registered with the scheduler.
    Created,
    /// Able to run; eligible for selection by the strategy.
    Enabled,
    /// Currently executing between two scheduling points.
    Running,
    /// Waiting on a lock or another operation; never selected.
    Blocked,
    /// Finished normally.
    Completed,
    /// Finished with an unhandled error or panic.
    Faulted,
}

impl OperationState {
    /// Whether the operation has finished, normally or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted)
    }
}

/// What a blocked operation is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitTarget {
    /// Waiting to acquire a lock.
    Lock(LockId),
    /// Waiting for another operation to finish.
    Operation(OperationId),
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock(id) => write!(f, "{id}"),
            Self::Operation(id) => write!(f, "{id}"),
        }
    }
}

/// Handle to a spawned operation, used to join it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    id: OperationId,
}

impl OperationHandle {
    pub(crate) const fn new(id: OperationId) -> Self {
        Self { id }
    }

    /// Id of the spawned operation.
    pub const fn id(&self) -> OperationId {
        self.id
    }
}

/// Scheduler-side record of one operation.
pub(crate) struct Operation {
    pub(crate) id: OperationId,
    pub(crate) state: OperationState,
    /// `None` while the continuation is being polled or after completion.
    pub(crate) continuation: Option<Continuation>,
    pub(crate) waits_on: Option<WaitTarget>,
}

impl Operation {
    pub(crate) fn new(id: OperationId, continuation: Continuation) -> Self {
        Self {
            id,
            state: OperationState::Created,
            continuation: Some(continuation),
            waits_on: None,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state == OperationState::Enabled
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("continuation", &self.continuation.as_ref().map(|_| "<future>"))
            .field("waits_on", &self.waits_on)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(OperationState::Completed.is_terminal());
        assert!(OperationState::Faulted.is_terminal());
        assert!(!OperationState::Blocked.is_terminal());
        assert!(!OperationState::Enabled.is_terminal());
    }

    #[test]
    fn new_operation_starts_created() {
        let op = Operation::new(OperationId::new(3), Box::pin(async { Ok(()) }));
        assert_eq!(op.state, OperationState::Created);
        assert!(!op.is_enabled());
        assert!(op.continuation.is_some());
    }

    #[test]
    fn ids_display_compactly() {
        assert_eq!(OperationId::new(7).to_string(), "op7");
        assert_eq!(WaitTarget::Lock(LockId::new(2)).to_string(), "lock2");
    }
}
