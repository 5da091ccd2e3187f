//! Futures that suspend the running operation.
//!
//! Each of these returns `Pending` after recording a [`Suspension`] in the
//! scheduler state. The controller reads it back once the poll returns and
//! only polls the operation again after the strategy picks it.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    task::{self, Poll},
};

use super::state::{PointKind, SchedulerState, Suspension};
use crate::operation::{LockId, OperationId, OperationState, WaitTarget};

/// Suspends exactly once, leaving the operation enabled.
pub(crate) struct SchedulingPoint<'a> {
    state: &'a RefCell<SchedulerState>,
    kind: PointKind,
    reached: bool,
}

impl<'a> SchedulingPoint<'a> {
    pub(crate) fn new(state: &'a RefCell<SchedulerState>, kind: PointKind) -> Self {
        Self { state, kind, reached: false }
    }
}

impl Future for SchedulingPoint<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _task: &mut task::Context<'_>) -> Poll<()> {
        if self.reached {
            return Poll::Ready(());
        }
        self.reached = true;

        let mut st = self.state.borrow_mut();
        tracing::trace!(operation = %st.caller(), point = ?self.kind, "scheduling point");
        st.suspend(Suspension::Switch(self.kind));
        Poll::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquirePhase {
    /// Report the lock-enter scheduling point.
    Announce,
    /// Take the lock or queue behind the holder.
    Contend,
    /// Queued; resumed only after the lock was handed over.
    Waiting,
}

/// Lock entry: a scheduling point followed by acquisition or blocking.
pub(crate) struct Acquire<'a> {
    state: &'a RefCell<SchedulerState>,
    lock: LockId,
    phase: AcquirePhase,
}

impl<'a> Acquire<'a> {
    pub(crate) fn new(state: &'a RefCell<SchedulerState>, lock: LockId) -> Self {
        Self { state, lock, phase: AcquirePhase::Announce }
    }
}

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _task: &mut task::Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let mut st = this.state.borrow_mut();
        let me = st.caller();

        match this.phase {
            AcquirePhase::Announce => {
                this.phase = AcquirePhase::Contend;
                tracing::trace!(operation = %me, lock = %this.lock, "lock enter point");
                st.suspend(Suspension::Switch(PointKind::LockEnter(this.lock)));
                Poll::Pending
            },
            AcquirePhase::Contend => {
                if st.try_acquire(this.lock, me, false) {
                    tracing::trace!(operation = %me, lock = %this.lock, "lock acquired");
                    return Poll::Ready(());
                }

                tracing::trace!(operation = %me, lock = %this.lock, "lock contended");
                st.enqueue_waiter(this.lock, me);
                this.phase = AcquirePhase::Waiting;
                st.suspend(Suspension::Block(WaitTarget::Lock(this.lock)));
                Poll::Pending
            },
            AcquirePhase::Waiting => {
                if st.try_acquire(this.lock, me, true) {
                    tracing::trace!(operation = %me, lock = %this.lock, "lock handed over");
                    return Poll::Ready(());
                }

                st.suspend(Suspension::Block(WaitTarget::Lock(this.lock)));
                Poll::Pending
            },
        }
    }
}

/// Waits for another operation to reach a terminal state.
pub(crate) struct Join<'a> {
    state: &'a RefCell<SchedulerState>,
    target: OperationId,
}

impl<'a> Join<'a> {
    pub(crate) fn new(state: &'a RefCell<SchedulerState>, target: OperationId) -> Self {
        Self { state, target }
    }
}

impl Future for Join<'_> {
    type Output = OperationState;

    fn poll(self: Pin<&mut Self>, _task: &mut task::Context<'_>) -> Poll<OperationState> {
        let mut st = self.state.borrow_mut();

        match st.operation(self.target).map(|op| op.state) {
            Some(state) if state.is_terminal() => Poll::Ready(state),
            Some(_) => {
                st.suspend(Suspension::Block(WaitTarget::Operation(self.target)));
                Poll::Pending
            },
            None => {
                tracing::warn!(target_op = %self.target, "join on unknown operation");
                Poll::Ready(OperationState::Faulted)
            },
        }
    }
}
