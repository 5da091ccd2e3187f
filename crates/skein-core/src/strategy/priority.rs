//! Priority-based scheduling with random change points.
//!
//! Every operation gets a random priority when first seen; the highest
//! priority enabled operation always runs. At a handful of randomly chosen
//! steps the running operation is demoted to the lowest priority. Bugs that
//! need only a few well-placed context switches are found with far higher
//! probability than under uniform random scheduling, because the strategy
//! rarely switches and switches where it counts.

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{SchedulingContext, Strategy, StrategyFactory};
use crate::{error::ReplayMismatch, operation::OperationId, runtime::IterationOutcome, trace::Trace};

/// Initial schedule length estimate before any iteration has been observed.
const DEFAULT_SCHEDULE_LENGTH: u64 = 16;

/// Priority scheduler for one iteration.
#[derive(Debug, Clone)]
pub struct PriorityStrategy {
    rng: ChaCha8Rng,
    /// Highest priority first.
    priorities: Vec<OperationId>,
    change_points: BTreeSet<u64>,
}

impl PriorityStrategy {
    /// Create a strategy with `change_points` demotion steps spread over the
    /// first `schedule_length` steps.
    pub fn new(seed: u64, change_points: u32, schedule_length: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let length = schedule_length.max(1);
        let wanted = u64::from(change_points).min(length) as usize;

        let mut points = BTreeSet::new();
        while points.len() < wanted {
            points.insert(rng.gen_range(0..length));
        }

        Self { rng, priorities: Vec::new(), change_points: points }
    }

    /// Steps at which the running operation is demoted.
    pub fn change_points(&self) -> impl Iterator<Item = u64> + '_ {
        self.change_points.iter().copied()
    }

    fn admit_new_operations(&mut self, enabled: &[OperationId]) {
        for id in enabled {
            if !self.priorities.contains(id) {
                let slot = self.rng.gen_range(0..=self.priorities.len());
                self.priorities.insert(slot, *id);
            }
        }
    }

    fn highest(&self, enabled: &[OperationId]) -> Option<usize> {
        self.priorities.iter().position(|id| enabled.contains(id))
    }
}

impl Strategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn choose_operation(
        &mut self,
        cx: &SchedulingContext<'_>,
    ) -> Result<OperationId, ReplayMismatch> {
        self.admit_new_operations(cx.enabled);

        if self.change_points.contains(&cx.step) {
            if let Some(index) = self.highest(cx.enabled) {
                let demoted = self.priorities.remove(index);
                tracing::trace!(step = cx.step, %demoted, "priority change point");
                self.priorities.push(demoted);
            }
        }

        let index = self.highest(cx.enabled).unwrap_or(0);
        Ok(self.priorities.get(index).copied().unwrap_or(cx.enabled[0]))
    }

    fn choose_boolean(&mut self, _step: u64) -> Result<bool, ReplayMismatch> {
        Ok(self.rng.gen_bool(0.5))
    }

    fn choose_integer(&mut self, _step: u64, bound: u64) -> Result<u64, ReplayMismatch> {
        Ok(self.rng.gen_range(0..bound))
    }
}

/// Factory for [`PriorityStrategy`].
///
/// Tracks the longest schedule seen so far so change points are spread over
/// the steps the program actually takes.
#[derive(Debug, Clone)]
pub struct PriorityFactory {
    change_points: u32,
    schedule_length: u64,
}

impl PriorityFactory {
    /// Factory placing `change_points` demotions per iteration.
    pub fn new(change_points: u32) -> Self {
        Self { change_points, schedule_length: DEFAULT_SCHEDULE_LENGTH }
    }

    /// Current schedule length estimate.
    pub fn schedule_length(&self) -> u64 {
        self.schedule_length
    }
}

impl StrategyFactory for PriorityFactory {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn create(&mut self, _iteration: u64, seed: u64) -> Box<dyn Strategy> {
        Box::new(PriorityStrategy::new(seed, self.change_points, self.schedule_length))
    }

    fn iteration_finished(&mut self, trace: &Trace, _outcome: &IterationOutcome) {
        self.schedule_length = self.schedule_length.max(trace.len() as u64);
    }
}
