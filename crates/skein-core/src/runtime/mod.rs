//! Cooperative runtime: operations, scheduling points and the controller.
//!
//! Test code receives a [`Context`] and expresses concurrency through it.
//! Every method that returns a future is a scheduling point: awaiting it
//! hands control back to the controller, which lets the strategy decide who
//! runs next. Everything else runs atomically.
//!
//! ```ignore
//! let entry = |cx: Context| async move {
//!     let lock = cx.new_lock("counter");
//!     let worker = cx.spawn(bump(cx.clone(), lock.clone())).await;
//!     bump(cx.clone(), lock).await?;
//!     cx.join(worker).await;
//!     Ok(())
//! };
//! ```

mod controller;
mod point;
mod state;

use std::{cell::RefCell, fmt, future::Future, rc::Rc, time::Duration};

pub use controller::{IterationOutcome, IterationResult, run_iteration};
use point::{Acquire, Join, SchedulingPoint};
pub use state::PointKind;
use state::SchedulerState;

use crate::{
    checker::Violation,
    error::{AssertionFailed, LockError},
    operation::{LockId, OperationHandle, OperationId, OperationResult, OperationState},
};

/// Logical mutual-exclusion handle.
///
/// At most one operation holds a lock at a time. Operations waiting for it
/// are blocked and never chosen; on release the lock passes to the longest
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    id: LockId,
    name: Rc<str>,
}

impl ResourceLock {
    /// Lock id, unique within the iteration.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to the scheduler of the running iteration.
///
/// Cheap to clone; every operation that needs the scheduler gets its own
/// clone. A context is only valid inside the iteration that created it.
#[derive(Clone)]
pub struct Context {
    state: Rc<RefCell<SchedulerState>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Context")
            .field("iteration", &st.iteration)
            .field("step", &st.step)
            .field("running", &st.running)
            .finish()
    }
}

impl Context {
    pub(crate) fn from_state(state: Rc<RefCell<SchedulerState>>) -> Self {
        Self { state }
    }

    /// Operation currently running, if any.
    pub fn current(&self) -> Option<OperationId> {
        self.state.borrow().running
    }

    /// Decisions made so far in this iteration.
    pub fn step(&self) -> u64 {
        self.state.borrow().step
    }

    /// Index of this iteration within the exploration.
    pub fn iteration(&self) -> u64 {
        self.state.borrow().iteration
    }

    /// Spawn `work` as a new operation. Scheduling point.
    ///
    /// The new operation is enabled immediately; the strategy may run it
    /// before the caller continues.
    pub async fn spawn<F>(&self, work: F) -> OperationHandle
    where
        F: Future<Output = OperationResult> + 'static,
    {
        let id = self.state.borrow_mut().spawn(Box::pin(work));
        SchedulingPoint::new(&self.state, PointKind::Spawn(id)).await;
        OperationHandle::new(id)
    }

    /// Give other operations a chance to run. Scheduling point.
    pub async fn yield_now(&self) {
        SchedulingPoint::new(&self.state, PointKind::Yield).await;
    }

    /// Timed wait. Scheduling point.
    ///
    /// Only the suspension is modelled. `duration` has no influence on when
    /// the caller resumes relative to other operations.
    pub async fn delay(&self, duration: Duration) {
        SchedulingPoint::new(&self.state, PointKind::Delay(duration)).await;
    }

    /// Scheduling point with no other effect.
    ///
    /// Place it between a read and a write of shared state that have no
    /// natural scheduling point between them, so the interleaving can be
    /// explored.
    pub async fn force_schedule_point(&self) {
        SchedulingPoint::new(&self.state, PointKind::Forced).await;
    }

    /// Create a lock owned by this iteration.
    pub fn new_lock(&self, name: impl Into<String>) -> ResourceLock {
        let name: String = name.into();
        let id = self.state.borrow_mut().new_lock(name.clone());
        ResourceLock { id, name: name.into() }
    }

    /// Operation holding `lock`, if any.
    pub fn lock_holder(&self, lock: &ResourceLock) -> Option<OperationId> {
        self.state.borrow().lock(lock.id).and_then(|l| l.held_by)
    }

    /// Acquire `lock`. Scheduling point.
    ///
    /// Blocks while another operation holds it. Acquiring a lock the caller
    /// already holds blocks forever and is reported as a deadlock.
    pub async fn enter_critical_section(&self, lock: &ResourceLock) {
        Acquire::new(&self.state, lock.id).await;
    }

    /// Release `lock`. Scheduling point.
    ///
    /// # Errors
    ///
    /// [`LockError::NotHeld`] if the caller does not hold `lock`. No
    /// scheduling point is reached in that case.
    pub async fn exit_critical_section(&self, lock: &ResourceLock) -> Result<(), LockError> {
        {
            let mut st = self.state.borrow_mut();
            let me = st.caller();
            st.release_lock(lock.id, me)?;
        }
        SchedulingPoint::new(&self.state, PointKind::LockExit(lock.id)).await;
        Ok(())
    }

    /// Wait until the operation behind `handle` has finished and return its
    /// final state. Blocks the caller if it has not.
    pub async fn join(&self, handle: OperationHandle) -> OperationState {
        Join::new(&self.state, handle.id()).await
    }

    /// Check a condition of the program under test.
    ///
    /// A false condition is recorded as an assertion violation right away
    /// and the iteration is aborted at the next scheduling point.
    ///
    /// # Errors
    ///
    /// [`AssertionFailed`] when `condition` is false, so the caller can stop
    /// with `?`.
    pub fn assert(
        &self,
        condition: bool,
        message: impl Into<String>,
    ) -> Result<(), AssertionFailed> {
        if condition {
            return Ok(());
        }

        let mut st = self.state.borrow_mut();
        let operation = st.caller();
        let message = message.into();
        tracing::debug!(%operation, %message, "assertion failed");
        st.record_violation(Violation::AssertionViolation { operation, message: message.clone() });
        Err(AssertionFailed { operation, message })
    }

    /// Register a global invariant, evaluated after every step.
    ///
    /// `check` returns a reason on failure. It runs while no operation is
    /// polled and should only read state.
    pub fn register_invariant(
        &self,
        name: impl Into<String>,
        check: impl Fn() -> Result<(), String> + 'static,
    ) {
        self.state.borrow_mut().invariants.register(name.into(), Box::new(check));
    }

    /// Nondeterministic boolean, resolved by the strategy and recorded in
    /// the trace. Not a scheduling point.
    pub fn choose_boolean(&self) -> bool {
        self.state.borrow_mut().choose_boolean()
    }

    /// Nondeterministic integer in `0..bound`, resolved by the strategy and
    /// recorded in the trace. Returns 0 without a choice when `bound` is 0.
    pub fn choose_integer(&self, bound: u64) -> u64 {
        self.state.borrow_mut().choose_integer(bound)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{operation::Fault, strategy::RoundRobinStrategy};

    fn round_robin() -> Box<dyn crate::strategy::Strategy> {
        Box::new(RoundRobinStrategy::new(0))
    }

    #[test]
    fn join_waits_for_child() {
        let seen = Rc::new(Cell::new(0u32));
        let out = Rc::clone(&seen);

        let entry = move |cx: Context| {
            let seen = Rc::clone(&out);
            async move {
                let child_seen = Rc::clone(&seen);
                let child = cx
                    .spawn({
                        let cx = cx.clone();
                        async move {
                            cx.yield_now().await;
                            cx.yield_now().await;
                            child_seen.set(7);
                            Ok::<(), Fault>(())
                        }
                    })
                    .await;
                let state = cx.join(child).await;
                cx.assert(state == OperationState::Completed, "child completed")?;
                cx.assert(seen.get() == 7, "child effect visible after join")?;
                Ok::<(), Fault>(())
            }
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        assert_eq!(result.outcome, IterationOutcome::Passed);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn joining_itself_deadlocks() {
        let entry = |cx: Context| async move {
            let me = OperationHandle::new(OperationId::ROOT);
            cx.join(me).await;
            Ok::<(), Fault>(())
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        let violation = result.outcome.violation().expect("deadlock");
        assert_eq!(violation.kind(), "DeadlockDetected");
    }

    #[test]
    fn releasing_unheld_lock_is_an_error() {
        let entry = |cx: Context| async move {
            let lock = cx.new_lock("orphan");
            let err = cx.exit_critical_section(&lock).await.expect_err("not held");
            cx.assert(matches!(err, LockError::NotHeld { holder: None, .. }), "not held")?;
            Ok::<(), Fault>(())
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        assert_eq!(result.outcome, IterationOutcome::Passed);
    }

    #[test]
    fn failed_assertion_aborts_iteration() {
        let entry = |cx: Context| async move {
            cx.assert(false, "balance is negative").ok();
            cx.yield_now().await;
            cx.assert(false, "never reached").ok();
            Ok::<(), Fault>(())
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        assert_eq!(
            result.outcome,
            IterationOutcome::Violation(Violation::AssertionViolation {
                operation: OperationId::ROOT,
                message: "balance is negative".to_string(),
            })
        );
        assert_eq!(result.steps, 1);
    }

    #[test]
    fn invariant_checked_after_each_step() {
        let entry = |cx: Context| async move {
            let counter = Rc::new(Cell::new(0u32));
            let watched = Rc::clone(&counter);
            cx.register_invariant("at most two", move || {
                let count = watched.get();
                if count <= 2 { Ok(()) } else { Err(format!("counter is {count}")) }
            });

            for _ in 0..5 {
                counter.set(counter.get() + 1);
                cx.yield_now().await;
            }
            Ok::<(), Fault>(())
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        let violation = result.outcome.violation().expect("invariant should break");
        assert_eq!(
            violation.to_string(),
            "assertion violation in op0: invariant 'at most two' violated: counter is 3"
        );
        assert_eq!(result.steps, 3);
    }

    #[test]
    fn panicking_invariant_aborts_the_iteration() {
        let entry = |cx: Context| async move {
            let samples: Rc<RefCell<Vec<u32>>> = Rc::default();
            let watched = Rc::clone(&samples);
            cx.register_invariant("first sample", move || {
                let first = watched.borrow()[0];
                if first < 10 { Ok(()) } else { Err(format!("first sample is {first}")) }
            });

            cx.yield_now().await;
            samples.borrow_mut().push(1);
            Ok::<(), Fault>(())
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        let Some(Violation::AssertionViolation { operation, message }) = result.outcome.violation()
        else {
            panic!("expected an assertion violation, got {:?}", result.outcome);
        };
        assert_eq!(*operation, OperationId::ROOT);
        assert!(message.starts_with("invariant 'first sample' panicked"), "{message}");
        assert_eq!(result.steps, 1);
    }

    #[test]
    fn lock_holder_is_tracked() {
        let entry = |cx: Context| async move {
            let lock = cx.new_lock("guard");
            cx.assert(cx.lock_holder(&lock).is_none(), "free at start")?;
            cx.enter_critical_section(&lock).await;
            cx.assert(cx.lock_holder(&lock) == Some(OperationId::ROOT), "held by root")?;
            cx.exit_critical_section(&lock).await?;
            cx.assert(cx.lock_holder(&lock).is_none(), "free again")?;
            Ok::<(), Fault>(())
        };

        let result = run_iteration(&entry, round_robin(), 100, 0).expect("engine error");
        assert_eq!(result.outcome, IterationOutcome::Passed);
    }
}
