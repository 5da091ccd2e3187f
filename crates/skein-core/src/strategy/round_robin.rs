//! Round-robin scheduling.

use super::{SchedulingContext, Strategy, StrategyFactory};
use crate::{error::ReplayMismatch, operation::OperationId};

/// Switches to the next enabled operation in id order at every scheduling
/// point, wrapping around.
///
/// The seed only picks where the rotation starts and the phase of the
/// boolean/integer counters, so different iterations still differ a little.
#[derive(Debug, Clone)]
pub struct RoundRobinStrategy {
    offset: u64,
    counter: u64,
}

impl RoundRobinStrategy {
    /// Create a strategy whose rotation starts at `seed`.
    pub fn new(seed: u64) -> Self {
        Self { offset: seed, counter: seed }
    }
}

impl Strategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn choose_operation(
        &mut self,
        cx: &SchedulingContext<'_>,
    ) -> Result<OperationId, ReplayMismatch> {
        let chosen = match cx.current {
            Some(current) => {
                cx.enabled.iter().copied().find(|id| *id > current).unwrap_or(cx.enabled[0])
            },
            None => {
                let start = (self.offset % cx.enabled.len() as u64) as usize;
                cx.enabled[start]
            },
        };
        Ok(chosen)
    }

    fn choose_boolean(&mut self, _step: u64) -> Result<bool, ReplayMismatch> {
        self.counter = self.counter.wrapping_add(1);
        Ok(self.counter % 2 == 0)
    }

    fn choose_integer(&mut self, _step: u64, bound: u64) -> Result<u64, ReplayMismatch> {
        self.counter = self.counter.wrapping_add(1);
        Ok(self.counter % bound)
    }
}

/// Factory for [`RoundRobinStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinFactory;

impl StrategyFactory for RoundRobinFactory {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn create(&mut self, _iteration: u64, seed: u64) -> Box<dyn Strategy> {
        Box::new(RoundRobinStrategy::new(seed))
    }
}
