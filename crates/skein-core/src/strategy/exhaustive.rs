//! Depth-first enumeration of every schedule.
//!
//! The schedule tree is kept by the factory. Each iteration replays the
//! current path, extends it with first choices where it runs past the end,
//! and after the iteration the deepest branch with untried alternatives is
//! advanced. When no branch has alternatives left the tree is exhausted.
//!
//! Operation choices and boolean/integer choices are both branch points.
//! The program under test must be deterministic apart from those choices,
//! otherwise the tree describes nothing in particular.

use std::{cell::RefCell, rc::Rc};

use super::{SchedulingContext, Strategy, StrategyFactory};
use crate::{error::ReplayMismatch, operation::OperationId, runtime::IterationOutcome, trace::Trace};

#[derive(Debug, Clone, Copy)]
struct Branch {
    options: usize,
    taken: usize,
}

#[derive(Debug, Default)]
struct SchedulePath {
    branches: Vec<Branch>,
    /// Depth reached by the iteration in progress.
    visited: usize,
    exhausted: bool,
}

impl SchedulePath {
    /// Index to take at `depth` among `options` alternatives.
    fn branch(&mut self, depth: usize, options: usize) -> usize {
        self.visited = depth + 1;
        match self.branches.get_mut(depth) {
            Some(branch) => {
                if branch.options != options {
                    tracing::warn!(
                        depth,
                        recorded = branch.options,
                        options,
                        "schedule tree diverged"
                    );
                    branch.options = options;
                    branch.taken = branch.taken.min(options - 1);
                }
                branch.taken
            },
            None => {
                self.branches.push(Branch { options, taken: 0 });
                0
            },
        }
    }

    /// Move to the next unexplored path.
    fn advance(&mut self) {
        self.branches.truncate(self.visited);
        self.visited = 0;

        while let Some(last) = self.branches.last_mut() {
            if last.taken + 1 < last.options {
                last.taken += 1;
                return;
            }
            self.branches.pop();
        }

        self.exhausted = true;
    }
}

/// Follows and extends the factory's schedule path for one iteration.
#[derive(Debug)]
pub struct ExhaustiveStrategy {
    path: Rc<RefCell<SchedulePath>>,
    depth: usize,
}

impl ExhaustiveStrategy {
    fn next(&mut self, options: usize) -> usize {
        let index = self.path.borrow_mut().branch(self.depth, options);
        self.depth += 1;
        index
    }
}

impl Strategy for ExhaustiveStrategy {
    fn name(&self) -> &'static str {
        "exhaustive"
    }

    fn choose_operation(
        &mut self,
        cx: &SchedulingContext<'_>,
    ) -> Result<OperationId, ReplayMismatch> {
        let index = self.next(cx.enabled.len());
        Ok(cx.enabled[index])
    }

    fn choose_boolean(&mut self, _step: u64) -> Result<bool, ReplayMismatch> {
        Ok(self.next(2) == 1)
    }

    fn choose_integer(&mut self, _step: u64, bound: u64) -> Result<u64, ReplayMismatch> {
        let options = usize::try_from(bound).unwrap_or(usize::MAX);
        Ok(self.next(options) as u64)
    }
}

/// Factory for [`ExhaustiveStrategy`]; owns the schedule tree.
#[derive(Debug, Default)]
pub struct ExhaustiveFactory {
    path: Rc<RefCell<SchedulePath>>,
}

impl ExhaustiveFactory {
    /// Factory positioned at the first schedule.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StrategyFactory for ExhaustiveFactory {
    fn name(&self) -> &'static str {
        "exhaustive"
    }

    fn create(&mut self, _iteration: u64, _seed: u64) -> Box<dyn Strategy> {
        Box::new(ExhaustiveStrategy { path: Rc::clone(&self.path), depth: 0 })
    }

    fn iteration_finished(&mut self, _trace: &Trace, _outcome: &IterationOutcome) {
        self.path.borrow_mut().advance();
    }

    fn is_exhausted(&self) -> bool {
        self.path.borrow().exhausted
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn op(n: u64) -> OperationId {
        OperationId::new(n)
    }

    /// Two operations with `steps` scheduling turns each, simulated without
    /// the runtime: returns every distinct schedule the factory produces.
    fn enumerate(steps: usize) -> BTreeSet<Vec<OperationId>> {
        let mut factory = ExhaustiveFactory::new();
        let mut schedules = BTreeSet::new();

        while !factory.is_exhausted() {
            let mut strategy = factory.create(0, 0);
            let mut remaining = [steps, steps];
            let mut schedule = Vec::new();

            while remaining.iter().any(|r| *r > 0) {
                let enabled: Vec<_> =
                    (0..2).filter(|i| remaining[*i] > 0).map(|i| op(i as u64)).collect();
                let cx = SchedulingContext {
                    step: schedule.len() as u64,
                    enabled: &enabled,
                    current: schedule.last().copied(),
                    history: &[],
                };
                let chosen = strategy.choose_operation(&cx).expect("exhaustive never fails");
                remaining[chosen.as_u64() as usize] -= 1;
                schedule.push(chosen);
            }

            assert!(schedules.insert(schedule), "schedule visited twice");
            factory.iteration_finished(&Trace::default(), &IterationOutcome::Passed);
        }

        schedules
    }

    #[test]
    fn enumerates_all_interleavings_once() {
        // C(4, 2) = 6 and C(6, 3) = 20.
        assert_eq!(enumerate(2).len(), 6);
        assert_eq!(enumerate(3).len(), 20);
    }

    #[test]
    fn boolean_choices_branch() {
        let mut factory = ExhaustiveFactory::new();
        let mut outcomes = Vec::new();

        while !factory.is_exhausted() {
            let mut strategy = factory.create(0, 0);
            let a = strategy.choose_boolean(0).expect("exhaustive never fails");
            let b = strategy.choose_boolean(0).expect("exhaustive never fails");
            outcomes.push((a, b));
            factory.iteration_finished(&Trace::default(), &IterationOutcome::Passed);
        }

        assert_eq!(outcomes, vec![(false, false), (false, true), (true, false), (true, true)]);
    }

    #[test]
    fn single_path_exhausts_after_one_iteration() {
        let mut factory = ExhaustiveFactory::new();
        let mut strategy = factory.create(0, 0);
        let enabled = [op(0)];
        let cx = SchedulingContext { step: 0, enabled: &enabled, current: None, history: &[] };
        assert_eq!(strategy.choose_operation(&cx), Ok(op(0)));

        factory.iteration_finished(&Trace::default(), &IterationOutcome::Passed);
        assert!(factory.is_exhausted());
    }
}
