//! Uniform random scheduling with a reproducible seed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{SchedulingContext, Strategy, StrategyFactory};
use crate::{error::ReplayMismatch, operation::OperationId};

/// Picks uniformly among enabled operations.
#[derive(Debug, Clone)]
pub struct RandomStrategy {
    rng: ChaCha8Rng,
}

impl RandomStrategy {
    /// Create a strategy seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed) }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose_operation(
        &mut self,
        cx: &SchedulingContext<'_>,
    ) -> Result<OperationId, ReplayMismatch> {
        let index = self.rng.gen_range(0..cx.enabled.len());
        Ok(cx.enabled[index])
    }

    fn choose_boolean(&mut self, _step: u64) -> Result<bool, ReplayMismatch> {
        Ok(self.rng.gen_bool(0.5))
    }

    fn choose_integer(&mut self, _step: u64, bound: u64) -> Result<u64, ReplayMismatch> {
        Ok(self.rng.gen_range(0..bound))
    }
}

/// Factory for [`RandomStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomFactory;

impl StrategyFactory for RandomFactory {
    fn name(&self) -> &'static str {
        "random"
    }

    fn create(&mut self, _iteration: u64, seed: u64) -> Box<dyn Strategy> {
        Box::new(RandomStrategy::new(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visits_every_enabled_operation_eventually() {
        let enabled: Vec<_> = (0..3).map(OperationId::new).collect();
        let mut strategy = RandomStrategy::new(7);
        let mut seen = [false; 3];

        for step in 0..200 {
            let cx = SchedulingContext { step, enabled: &enabled, current: None, history: &[] };
            let chosen = strategy.choose_operation(&cx).expect("random never fails");
            seen[chosen.as_u64() as usize] = true;
        }

        assert_eq!(seen, [true; 3]);
    }

    #[test]
    fn integer_choices_stay_in_bounds() {
        let mut strategy = RandomStrategy::new(1);
        for _ in 0..100 {
            assert!(strategy.choose_integer(0, 5).expect("random never fails") < 5);
        }
    }
}
