//! Reinforcement-guided scheduling.
//!
//! A value is learned for every (abstract state, chosen operation) pair.
//! Each visit costs a small penalty and an iteration that ends in a
//! violation pays a reward back along its schedule, so over many iterations
//! the strategy drifts toward choices it has rarely taken and toward choices
//! that have led to bugs. Selection is a softmax over those values, sampled
//! with the iteration's seeded RNG, which keeps every run reproducible from
//! its master seed.

use std::{
    cell::RefCell,
    collections::{HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    rc::Rc,
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{SchedulingContext, Strategy, StrategyFactory};
use crate::{
    error::ReplayMismatch,
    operation::OperationId,
    runtime::IterationOutcome,
    trace::{Decision, Trace},
};

/// Learning rate.
const ALPHA: f64 = 0.3;
/// Discount for future value.
const GAMMA: f64 = 0.7;
/// Reward for every transition; negative so repeated paths lose appeal.
const VISIT_REWARD: f64 = -1.0;
/// Reward credited to the last transition of a failing iteration.
const VIOLATION_REWARD: f64 = 25.0;
/// Softmax temperature.
const TEMPERATURE: f64 = 0.25;

/// Abstract state: the enabled set plus the last two scheduled operations.
fn state_key(enabled: &[OperationId], history: &[Decision]) -> u64 {
    let mut hasher = DefaultHasher::new();
    enabled.hash(&mut hasher);
    for decision in history.iter().rev().take(2) {
        decision.chosen.hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Default)]
struct ValueTable {
    values: HashMap<(u64, OperationId), f64>,
}

impl ValueTable {
    fn value(&self, state: u64, op: OperationId) -> f64 {
        self.values.get(&(state, op)).copied().unwrap_or(0.0)
    }

    fn best(&self, state: u64, enabled: &[OperationId]) -> f64 {
        enabled.iter().map(|op| self.value(state, *op)).fold(f64::NEG_INFINITY, f64::max)
    }

    /// Temporal-difference update backwards along one schedule.
    fn learn(&mut self, decisions: &[Decision], violated: bool) {
        for (k, decision) in decisions.iter().enumerate().rev() {
            let state = state_key(&decision.enabled, &decisions[..k]);
            let last = k + 1 == decisions.len();

            let mut reward = VISIT_REWARD;
            if last && violated {
                reward += VIOLATION_REWARD;
            }

            let future = match decisions.get(k + 1) {
                Some(next) => {
                    GAMMA * self.best(state_key(&next.enabled, &decisions[..=k]), &next.enabled)
                },
                None => 0.0,
            };

            let entry = self.values.entry((state, decision.chosen)).or_insert(0.0);
            *entry += ALPHA * (reward + future - *entry);
        }
    }
}

/// Softmax scheduler over a shared learned value table.
#[derive(Debug)]
pub struct GuidedStrategy {
    rng: ChaCha8Rng,
    table: Rc<RefCell<ValueTable>>,
}

impl Strategy for GuidedStrategy {
    fn name(&self) -> &'static str {
        "guided"
    }

    fn choose_operation(
        &mut self,
        cx: &SchedulingContext<'_>,
    ) -> Result<OperationId, ReplayMismatch> {
        let table = self.table.borrow();
        let state = state_key(cx.enabled, cx.history);

        let values: Vec<f64> = cx.enabled.iter().map(|op| table.value(state, *op)).collect();
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = values.iter().map(|v| ((v - max) / TEMPERATURE).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mut target = self.rng.gen_range(0.0..total);
        for (op, weight) in cx.enabled.iter().zip(&weights) {
            if target < *weight {
                return Ok(*op);
            }
            target -= weight;
        }

        Ok(cx.enabled[cx.enabled.len() - 1])
    }

    fn choose_boolean(&mut self, _step: u64) -> Result<bool, ReplayMismatch> {
        Ok(self.rng.gen_bool(0.5))
    }

    fn choose_integer(&mut self, _step: u64, bound: u64) -> Result<u64, ReplayMismatch> {
        Ok(self.rng.gen_range(0..bound))
    }
}

/// Factory for [`GuidedStrategy`]; owns the value table across iterations.
#[derive(Debug, Default)]
pub struct GuidedFactory {
    table: Rc<RefCell<ValueTable>>,
}

impl GuidedFactory {
    /// Factory with an empty value table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of learned (state, operation) values.
    pub fn learned_values(&self) -> usize {
        self.table.borrow().values.len()
    }
}

impl StrategyFactory for GuidedFactory {
    fn name(&self) -> &'static str {
        "guided"
    }

    fn create(&mut self, _iteration: u64, seed: u64) -> Box<dyn Strategy> {
        let rng = ChaCha8Rng::seed_from_u64(seed);
        Box::new(GuidedStrategy { rng, table: Rc::clone(&self.table) })
    }

    fn iteration_finished(&mut self, trace: &Trace, outcome: &IterationOutcome) {
        let violated = matches!(outcome, IterationOutcome::Violation(_));
        self.table.borrow_mut().learn(trace.decisions(), violated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u64) -> OperationId {
        OperationId::new(n)
    }

    fn decision(step: u64, chosen: u64) -> Decision {
        Decision { step, chosen: op(chosen), enabled: vec![op(0), op(1)], choices: Vec::new() }
    }

    #[test]
    fn visited_choices_lose_value() {
        let mut table = ValueTable::default();
        let decisions = vec![decision(0, 0)];
        table.learn(&decisions, false);

        let state = state_key(&[op(0), op(1)], &[]);
        assert!(table.value(state, op(0)) < 0.0);
        assert!((table.value(state, op(1))).abs() < f64::EPSILON);
    }

    #[test]
    fn violations_reward_the_failing_choice() {
        let mut table = ValueTable::default();
        table.learn(&[decision(0, 1)], true);

        let state = state_key(&[op(0), op(1)], &[]);
        assert!(table.value(state, op(1)) > 0.0);
    }

    #[test]
    fn guided_prefers_unvisited_operation() {
        let mut factory = GuidedFactory::new();
        // Penalise choosing op0 at the initial state many times over.
        let trace = Trace::from_decisions(vec![decision(0, 0)]);
        for _ in 0..30 {
            factory.iteration_finished(&trace, &IterationOutcome::Passed);
        }
        assert_eq!(factory.learned_values(), 1);

        let enabled = [op(0), op(1)];
        let cx = SchedulingContext { step: 0, enabled: &enabled, current: None, history: &[] };
        let mut unvisited = 0;
        for seed in 0..100 {
            let mut strategy = factory.create(0, seed);
            if strategy.choose_operation(&cx).expect("guided never fails") == op(1) {
                unvisited += 1;
            }
        }
        assert!(unvisited > 90, "expected a strong bias toward op1, got {unvisited}/100");
    }
}
