//! Execution controller: runs one iteration one operation at a time.
//!
//! Every step asks the strategy for an enabled operation, records the
//! decision and polls that operation's continuation exactly once. Whatever
//! the operation does before it reaches its next scheduling point happens
//! inside that single poll, so no other operation can observe it half done.

use std::{
    cell::RefCell,
    future::{self, Future},
    mem,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    task::{self, Poll, Waker},
};

use super::{
    Context,
    state::{SchedulerState, Suspension},
};
use crate::{
    checker::{Violation, panic_message},
    error::{EngineError, ReplayMismatch},
    operation::{Continuation, Fault, OperationId, OperationResult, OperationState},
    strategy::{SchedulingContext, Strategy},
    trace::Trace,
};

/// How one iteration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Every operation completed without a violation.
    Passed,
    /// A bug was found.
    Violation(Violation),
    /// The step bound was reached first. Inconclusive.
    StepBudgetExceeded {
        /// Decisions made before the abort.
        steps: u64,
    },
    /// A replayed trace diverged from the live program.
    ReplayMismatch(ReplayMismatch),
}

impl IterationOutcome {
    /// The violation, if this outcome is one.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Violation(violation) => Some(violation),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Violation(_) => "violation",
            Self::StepBudgetExceeded { .. } => "inconclusive",
            Self::ReplayMismatch(_) => "replay mismatch",
        }
    }
}

/// Outcome and trace of a finished iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// How the iteration ended.
    pub outcome: IterationOutcome,
    /// Every decision made, in order.
    pub trace: Trace,
    /// Number of decisions made.
    pub steps: u64,
}

/// Run one iteration of `entry` under `strategy`.
///
/// The entry point becomes operation 0. The iteration ends when every
/// operation has finished, on the first violation, on a replay mismatch, or
/// after `max_steps` decisions. All operations are discarded on return.
///
/// # Errors
///
/// [`EngineError::InvalidChoice`] if the strategy picks an operation that is
/// not enabled.
pub fn run_iteration<F, Fut>(
    entry: &F,
    strategy: Box<dyn Strategy>,
    max_steps: u64,
    iteration: u64,
) -> Result<IterationResult, EngineError>
where
    F: Fn(Context) -> Fut,
    Fut: Future<Output = OperationResult> + 'static,
{
    let state = Rc::new(RefCell::new(SchedulerState::new(strategy, iteration)));
    let cx = Context::from_state(Rc::clone(&state));

    // A panic while building the entry future faults the root operation at
    // its first step, like a panic while polling it.
    let root: Continuation = match panic::catch_unwind(AssertUnwindSafe(|| entry(cx))) {
        Ok(work) => Box::pin(work),
        Err(payload) => {
            let fault: Fault = panic_message(payload.as_ref()).into();
            Box::pin(future::ready(Err(fault)))
        },
    };
    state.borrow_mut().spawn(root);

    let outcome = drive(&state, max_steps);

    // Continuations and invariants may hold `Context` clones. Detach them
    // before the state goes so the `Rc` cycle is broken, and drop them
    // without the state borrowed.
    let (continuations, invariants, trace, steps) = {
        let mut st = state.borrow_mut();
        (
            st.take_continuations(),
            mem::take(&mut st.invariants),
            mem::take(&mut st.recorder).finish(),
            st.step,
        )
    };
    drop(continuations);
    drop(invariants);

    Ok(IterationResult { outcome: outcome?, trace, steps })
}

fn drive(state: &RefCell<SchedulerState>, max_steps: u64) -> Result<IterationOutcome, EngineError> {
    loop {
        if let Some(outcome) = aborted(state) {
            return Ok(finish(state, outcome));
        }

        let (enabled, steps) = {
            let st = state.borrow();
            (st.enabled(), st.step)
        };

        if enabled.is_empty() {
            let blocked = state.borrow().unfinished();
            let outcome = if blocked.is_empty() {
                IterationOutcome::Passed
            } else {
                IterationOutcome::Violation(Violation::DeadlockDetected { blocked })
            };
            return Ok(finish(state, outcome));
        }

        if steps >= max_steps {
            return Ok(IterationOutcome::StepBudgetExceeded { steps });
        }

        let Some(chosen) = choose(state, enabled)? else {
            continue;
        };

        run_step(state, chosen);
        check_invariants(state, chosen);
    }
}

/// Replay mismatch or violation recorded during the last step.
fn aborted(state: &RefCell<SchedulerState>) -> Option<IterationOutcome> {
    let st = state.borrow();
    if let Some(mismatch) = &st.mismatch {
        return Some(IterationOutcome::ReplayMismatch(mismatch.clone()));
    }
    st.violation.clone().map(IterationOutcome::Violation)
}

/// Let the strategy veto a completed iteration; replay uses this to reject
/// traces that were not fully consumed.
fn finish(state: &RefCell<SchedulerState>, outcome: IterationOutcome) -> IterationOutcome {
    if matches!(outcome, IterationOutcome::ReplayMismatch(_)) {
        return outcome;
    }

    let mut st = state.borrow_mut();
    let steps = st.step;
    match st.strategy.finish(steps) {
        Ok(()) => outcome,
        Err(mismatch) => IterationOutcome::ReplayMismatch(mismatch),
    }
}

/// Consult the strategy and record the decision. `None` if the strategy
/// reported a replay mismatch.
fn choose(
    state: &RefCell<SchedulerState>,
    enabled: Vec<OperationId>,
) -> Result<Option<OperationId>, EngineError> {
    let mut guard = state.borrow_mut();
    let st = &mut *guard;

    let cx = SchedulingContext {
        step: st.step,
        enabled: &enabled,
        current: st.last_run,
        history: st.recorder.decisions(),
    };

    match st.strategy.choose_operation(&cx) {
        Ok(chosen) if enabled.contains(&chosen) => {
            let step = st.step;
            st.recorder.record_decision(step, chosen, enabled);
            st.step += 1;
            Ok(Some(chosen))
        },
        Ok(chosen) => Err(EngineError::InvalidChoice {
            strategy: st.strategy.name(),
            step: st.step,
            chosen,
            enabled,
        }),
        Err(mismatch) => {
            tracing::warn!(iteration = st.iteration, %mismatch, "replay diverged");
            st.set_mismatch(mismatch);
            Ok(None)
        },
    }
}

/// Poll `chosen` once, then file it as enabled, blocked or finished.
fn run_step(state: &RefCell<SchedulerState>, chosen: OperationId) {
    let continuation = {
        let mut st = state.borrow_mut();
        st.running = Some(chosen);
        st.suspension = None;
        st.operation_mut(chosen).and_then(|op| {
            op.state = OperationState::Running;
            op.continuation.take()
        })
    };

    let Some(mut continuation) = continuation else {
        let mut st = state.borrow_mut();
        st.running = None;
        if let Some(op) = st.operation_mut(chosen) {
            op.state = OperationState::Faulted;
        }
        st.record_violation(Violation::UnhandledOperationFault {
            operation: chosen,
            message: "operation has no continuation to resume".to_string(),
        });
        return;
    };

    let mut task_cx = task::Context::from_waker(Waker::noop());
    let polled = panic::catch_unwind(AssertUnwindSafe(|| continuation.as_mut().poll(&mut task_cx)));

    // Anything the finished future owns is dropped after the borrow ends.
    let mut finished = None;
    let mut st = state.borrow_mut();
    st.running = None;
    st.last_run = Some(chosen);
    let suspension = st.suspension.take();

    let fault = match polled {
        Ok(Poll::Pending) => match suspension {
            Some(Suspension::Switch(_)) => {
                if let Some(op) = st.operation_mut(chosen) {
                    op.state = OperationState::Enabled;
                    op.continuation = Some(continuation);
                }
                None
            },
            Some(Suspension::Block(target)) => {
                tracing::trace!(operation = %chosen, %target, "operation blocked");
                if let Some(op) = st.operation_mut(chosen) {
                    op.state = OperationState::Blocked;
                    op.waits_on = Some(target);
                    op.continuation = Some(continuation);
                }
                None
            },
            None => {
                finished = Some(continuation);
                Some("suspended outside a scheduling point".to_string())
            },
        },
        Ok(Poll::Ready(Ok(()))) => {
            finished = Some(continuation);
            tracing::trace!(operation = %chosen, "operation completed");
            if let Some(op) = st.operation_mut(chosen) {
                op.state = OperationState::Completed;
            }
            st.wake_joiners(chosen);
            None
        },
        Ok(Poll::Ready(Err(err))) => {
            finished = Some(continuation);
            Some(err.to_string())
        },
        Err(payload) => {
            finished = Some(continuation);
            Some(panic_message(payload.as_ref()))
        },
    };

    if let Some(message) = fault {
        tracing::trace!(operation = %chosen, %message, "operation faulted");
        if let Some(op) = st.operation_mut(chosen) {
            op.state = OperationState::Faulted;
        }
        st.wake_joiners(chosen);
        st.record_violation(Violation::UnhandledOperationFault { operation: chosen, message });
    }

    drop(st);
    drop(finished);
}

/// Evaluate registered invariants after the step `after` ran.
fn check_invariants(state: &RefCell<SchedulerState>, after: OperationId) {
    let invariants = {
        let mut st = state.borrow_mut();
        if st.violation.is_some() || st.invariants.is_empty() {
            return;
        }
        mem::take(&mut st.invariants)
    };

    // Checks run unborrowed; they may read state through a `Context`.
    let violation = invariants.check(after);

    let mut st = state.borrow_mut();
    st.invariants = invariants;
    if let Some(violation) = violation {
        st.record_violation(violation);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{operation::Fault, strategy::RandomStrategy};

    fn random(seed: u64) -> Box<dyn Strategy> {
        Box::new(RandomStrategy::new(seed))
    }

    #[test]
    fn single_operation_passes() {
        let result = run_iteration(&|_cx: Context| async { Ok::<(), Fault>(()) }, random(0), 10, 0)
            .expect("engine error");

        assert_eq!(result.outcome, IterationOutcome::Passed);
        assert_eq!(result.steps, 1);
        assert_eq!(result.trace.schedule(), vec![OperationId::ROOT]);
    }

    #[test]
    fn each_yield_costs_one_decision() {
        let entry = |cx: Context| async move {
            cx.yield_now().await;
            cx.yield_now().await;
            Ok::<(), Fault>(())
        };
        let result = run_iteration(&entry, random(0), 10, 0).expect("engine error");

        assert_eq!(result.outcome, IterationOutcome::Passed);
        assert_eq!(result.steps, 3);
    }

    #[test]
    fn runaway_loop_is_inconclusive() {
        let entry = |cx: Context| async move {
            for _ in 0..1_000 {
                cx.yield_now().await;
            }
            Ok::<(), Fault>(())
        };
        let result = run_iteration(&entry, random(0), 25, 0).expect("engine error");

        assert_eq!(result.outcome, IterationOutcome::StepBudgetExceeded { steps: 25 });
        assert_eq!(result.trace.len(), 25);
    }

    #[test]
    fn error_escaping_operation_is_a_fault() {
        let entry = |_cx: Context| async { Err::<(), Fault>("connection reset".into()) };
        let result = run_iteration(&entry, random(0), 10, 0).expect("engine error");

        assert_eq!(
            result.outcome,
            IterationOutcome::Violation(Violation::UnhandledOperationFault {
                operation: OperationId::ROOT,
                message: "connection reset".to_string(),
            })
        );
    }

    #[test]
    fn foreign_suspension_is_a_fault() {
        let entry = |_cx: Context| async {
            std::future::pending::<()>().await;
            Ok::<(), Fault>(())
        };
        let result = run_iteration(&entry, random(0), 10, 0).expect("engine error");

        let violation = result.outcome.violation().expect("fault expected");
        assert_eq!(violation.kind(), "UnhandledOperationFault");
    }

    #[test]
    fn panic_building_entry_future_is_a_fault() {
        let entry = |cx: Context| {
            let replicas: Vec<u32> = Vec::new();
            let leader = replicas[0];
            async move {
                cx.yield_now().await;
                cx.assert(leader > 0, "leader elected")?;
                Ok::<(), Fault>(())
            }
        };
        let result = run_iteration(&entry, random(0), 10, 0).expect("engine error");

        let Some(Violation::UnhandledOperationFault { operation, message }) =
            result.outcome.violation()
        else {
            panic!("expected a fault, got {:?}", result.outcome);
        };
        assert_eq!(*operation, OperationId::ROOT);
        assert!(message.starts_with("panicked: index out of bounds"), "{message}");
        assert_eq!(result.steps, 1);
    }

    #[test]
    fn continuations_are_dropped_when_iteration_ends() {
        struct Flag(Rc<Cell<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let flag = Rc::clone(&dropped);
        let entry = move |cx: Context| {
            let guard = Flag(Rc::clone(&flag));
            async move {
                let _guard = guard;
                for _ in 0..1_000 {
                    cx.yield_now().await;
                }
                Ok::<(), Fault>(())
            }
        };

        let result = run_iteration(&entry, random(0), 5, 0).expect("engine error");
        assert!(matches!(result.outcome, IterationOutcome::StepBudgetExceeded { .. }));
        assert!(dropped.get());
    }

    #[test]
    fn invalid_choice_is_an_engine_error() {
        struct Rogue;
        impl Strategy for Rogue {
            fn name(&self) -> &'static str {
                "rogue"
            }
            fn choose_operation(
                &mut self,
                _cx: &SchedulingContext<'_>,
            ) -> Result<OperationId, ReplayMismatch> {
                Ok(OperationId::new(99))
            }
            fn choose_boolean(&mut self, _step: u64) -> Result<bool, ReplayMismatch> {
                Ok(false)
            }
            fn choose_integer(&mut self, _step: u64, _bound: u64) -> Result<u64, ReplayMismatch> {
                Ok(0)
            }
        }

        let entry = |_cx: Context| async { Ok::<(), Fault>(()) };
        let err = run_iteration(&entry, Box::new(Rogue), 10, 0).expect_err("rogue strategy");
        assert!(matches!(err, EngineError::InvalidChoice { strategy: "rogue", step: 0, .. }));
    }
}
