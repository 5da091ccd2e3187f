//! Per-iteration scheduler state.

use std::{collections::VecDeque, time::Duration};

use crate::{
    checker::{BlockedOperation, InvariantSet, Violation},
    error::{LockError, ReplayMismatch},
    operation::{Continuation, LockId, Operation, OperationId, OperationState, WaitTarget},
    strategy::Strategy,
    trace::{Choice, TraceRecorder},
};

/// Program action at which the running operation gives up control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    /// A new operation was spawned.
    Spawn(OperationId),
    /// Voluntary yield.
    Yield,
    /// Timed wait. The duration is logged and otherwise ignored.
    Delay(Duration),
    /// About to enter a critical section.
    LockEnter(LockId),
    /// Just left a critical section.
    LockExit(LockId),
    /// Explicit switch with no other effect.
    Forced,
}

/// Why the running operation returned `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspension {
    /// Reached a scheduling point and can continue right away.
    Switch(PointKind),
    /// Cannot continue until the target resolves.
    Block(WaitTarget),
}

#[derive(Debug)]
pub(crate) struct LockState {
    pub(crate) name: String,
    pub(crate) held_by: Option<OperationId>,
    pub(crate) waiters: VecDeque<OperationId>,
}

/// Everything one iteration owns. Created at iteration start and dropped at
/// its end; nothing here is shared between iterations.
pub(crate) struct SchedulerState {
    pub(crate) iteration: u64,
    pub(crate) operations: Vec<Operation>,
    pub(crate) locks: Vec<LockState>,
    /// Operation being polled right now.
    pub(crate) running: Option<OperationId>,
    /// Operation that ran the previous step.
    pub(crate) last_run: Option<OperationId>,
    /// Set by scheduling-point futures before they return `Pending`.
    pub(crate) suspension: Option<Suspension>,
    pub(crate) strategy: Box<dyn Strategy>,
    pub(crate) recorder: TraceRecorder,
    pub(crate) invariants: InvariantSet,
    /// Decisions made so far.
    pub(crate) step: u64,
    pub(crate) violation: Option<Violation>,
    pub(crate) mismatch: Option<ReplayMismatch>,
}

impl SchedulerState {
    pub(crate) fn new(strategy: Box<dyn Strategy>, iteration: u64) -> Self {
        Self {
            iteration,
            operations: Vec::new(),
            locks: Vec::new(),
            running: None,
            last_run: None,
            suspension: None,
            strategy,
            recorder: TraceRecorder::default(),
            invariants: InvariantSet::default(),
            step: 0,
            violation: None,
            mismatch: None,
        }
    }

    /// Register new work and enable it.
    pub(crate) fn spawn(&mut self, continuation: Continuation) -> OperationId {
        let id = OperationId::new(self.operations.len() as u64);
        let mut op = Operation::new(id, continuation);
        op.state = OperationState::Enabled;
        self.operations.push(op);
        tracing::trace!(%id, parent = ?self.running, "spawned operation");
        id
    }

    pub(crate) fn operation(&self, id: OperationId) -> Option<&Operation> {
        usize::try_from(id.as_u64()).ok().and_then(|i| self.operations.get(i))
    }

    pub(crate) fn operation_mut(&mut self, id: OperationId) -> Option<&mut Operation> {
        usize::try_from(id.as_u64()).ok().and_then(|i| self.operations.get_mut(i))
    }

    /// Enabled operations in id order.
    pub(crate) fn enabled(&self) -> Vec<OperationId> {
        self.operations.iter().filter(|op| op.is_enabled()).map(|op| op.id).collect()
    }

    /// Operations that have not finished.
    pub(crate) fn unfinished(&self) -> Vec<BlockedOperation> {
        self.operations
            .iter()
            .filter(|op| !op.state.is_terminal())
            .map(|op| BlockedOperation { operation: op.id, waits_on: op.waits_on })
            .collect()
    }

    /// Caller for API methods; the entry operation if nothing is running.
    pub(crate) fn caller(&self) -> OperationId {
        self.running.unwrap_or(OperationId::ROOT)
    }

    /// Record why the running operation is about to return `Pending`.
    /// The first suspension of a poll wins.
    pub(crate) fn suspend(&mut self, suspension: Suspension) {
        if self.suspension.is_none() {
            self.suspension = Some(suspension);
        }
    }

    /// Keep the first violation of the iteration.
    pub(crate) fn record_violation(&mut self, violation: Violation) {
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
    }

    fn record_mismatch(&mut self, mismatch: ReplayMismatch) {
        if self.mismatch.is_none() {
            self.mismatch = Some(mismatch);
        }
    }

    /// Enable every operation blocked on joining `done`.
    pub(crate) fn wake_joiners(&mut self, done: OperationId) {
        for op in &mut self.operations {
            if op.state == OperationState::Blocked
                && op.waits_on == Some(WaitTarget::Operation(done))
            {
                op.state = OperationState::Enabled;
                op.waits_on = None;
            }
        }
    }

    pub(crate) fn new_lock(&mut self, name: String) -> LockId {
        let id = LockId::new(self.locks.len() as u32);
        self.locks.push(LockState { name, held_by: None, waiters: VecDeque::new() });
        id
    }

    pub(crate) fn lock(&self, id: LockId) -> Option<&LockState> {
        self.locks.get(id.index())
    }

    /// Take `lock` for `op` if it is free or was handed to `op`.
    pub(crate) fn try_acquire(&mut self, lock: LockId, op: OperationId, handed_off: bool) -> bool {
        let Some(state) = self.locks.get_mut(lock.index()) else {
            return false;
        };

        match state.held_by {
            None => {
                state.held_by = Some(op);
                true
            },
            Some(holder) => handed_off && holder == op,
        }
    }

    pub(crate) fn enqueue_waiter(&mut self, lock: LockId, op: OperationId) {
        if let Some(state) = self.locks.get_mut(lock.index()) {
            state.waiters.push_back(op);
        }
    }

    /// Release `lock` held by `op`, handing it to the first waiter.
    pub(crate) fn release_lock(&mut self, lock: LockId, op: OperationId) -> Result<(), LockError> {
        let Some(state) = self.locks.get_mut(lock.index()) else {
            return Err(LockError::NotHeld { lock, operation: op, holder: None });
        };

        if state.held_by != Some(op) {
            return Err(LockError::NotHeld { lock, operation: op, holder: state.held_by });
        }

        state.held_by = state.waiters.pop_front();
        let next = state.held_by;
        tracing::trace!(%lock, name = %state.name, from = %op, to = ?next, "lock released");

        if let Some(next) = next {
            if let Some(waiter) = self.operation_mut(next) {
                waiter.state = OperationState::Enabled;
                waiter.waits_on = None;
            }
        }

        Ok(())
    }

    /// Index of the decision whose turn is executing.
    fn current_step(&self) -> u64 {
        self.step.saturating_sub(1)
    }

    pub(crate) fn choose_boolean(&mut self) -> bool {
        if self.mismatch.is_some() {
            return false;
        }

        match self.strategy.choose_boolean(self.current_step()) {
            Ok(value) => {
                self.recorder.record_choice(Choice::Boolean(value));
                value
            },
            Err(mismatch) => {
                self.record_mismatch(mismatch);
                false
            },
        }
    }

    pub(crate) fn choose_integer(&mut self, bound: u64) -> u64 {
        if bound == 0 || self.mismatch.is_some() {
            return 0;
        }

        match self.strategy.choose_integer(self.current_step(), bound) {
            Ok(value) if value < bound => {
                self.recorder.record_choice(Choice::Integer { bound, value });
                value
            },
            Ok(value) => {
                tracing::error!(
                    value,
                    bound,
                    strategy = self.strategy.name(),
                    "integer choice out of range"
                );
                self.recorder.record_choice(Choice::Integer { bound, value: value % bound });
                value % bound
            },
            Err(mismatch) => {
                self.record_mismatch(mismatch);
                0
            },
        }
    }

    pub(crate) fn set_mismatch(&mut self, mismatch: ReplayMismatch) {
        self.record_mismatch(mismatch);
    }

    /// Detach every continuation so nothing in them outlives the iteration.
    pub(crate) fn take_continuations(&mut self) -> Vec<Continuation> {
        self.operations.iter_mut().filter_map(|op| op.continuation.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RandomStrategy;

    fn state() -> SchedulerState {
        SchedulerState::new(Box::new(RandomStrategy::new(0)), 0)
    }

    fn idle() -> Continuation {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn spawned_operations_are_enabled_in_id_order() {
        let mut st = state();
        let a = st.spawn(idle());
        let b = st.spawn(idle());
        assert_eq!(a, OperationId::ROOT);
        assert_eq!(st.enabled(), vec![a, b]);
    }

    #[test]
    fn lock_is_handed_to_first_waiter() {
        let mut st = state();
        let a = st.spawn(idle());
        let b = st.spawn(idle());
        let c = st.spawn(idle());
        let lock = st.new_lock("l".to_string());

        assert!(st.try_acquire(lock, a, false));
        assert!(!st.try_acquire(lock, b, false));
        for waiter in [b, c] {
            st.enqueue_waiter(lock, waiter);
            let op = st.operation_mut(waiter).expect("exists");
            op.state = OperationState::Blocked;
            op.waits_on = Some(WaitTarget::Lock(lock));
        }
        assert_eq!(st.enabled(), vec![a]);

        st.release_lock(lock, a).expect("a holds the lock");
        assert_eq!(st.lock(lock).and_then(|l| l.held_by), Some(b));
        assert_eq!(st.enabled(), vec![a, b]);
        assert!(st.try_acquire(lock, b, true));
        assert!(!st.try_acquire(lock, c, false));
    }

    #[test]
    fn releasing_unheld_lock_fails() {
        let mut st = state();
        let a = st.spawn(idle());
        let lock = st.new_lock("l".to_string());

        let err = st.release_lock(lock, a).expect_err("not held");
        assert_eq!(err, LockError::NotHeld { lock, operation: a, holder: None });
    }

    #[test]
    fn reentrant_acquire_does_not_succeed() {
        let mut st = state();
        let a = st.spawn(idle());
        let lock = st.new_lock("l".to_string());

        assert!(st.try_acquire(lock, a, false));
        assert!(!st.try_acquire(lock, a, false));
    }

    #[test]
    fn zero_bound_integer_choice_is_not_recorded() {
        let mut st = state();
        st.recorder.record_decision(0, OperationId::ROOT, vec![OperationId::ROOT]);
        st.step = 1;

        assert_eq!(st.choose_integer(0), 0);
        let _ = st.choose_integer(4);
        let trace = std::mem::take(&mut st.recorder).finish();
        assert_eq!(trace.decisions()[0].choices.len(), 1);
    }
}
