//! Exploration configuration.

use crate::{error::ConfigError, strategy::StrategyKind, trace::Trace};

/// Default number of iterations.
pub const DEFAULT_ITERATIONS: u64 = 100;

/// Default bound on decisions per iteration.
pub const DEFAULT_MAX_STEPS: u64 = 10_000;

/// Settings for one exploration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorationConfig {
    /// Iterations to run before giving up (default 100).
    pub iterations: u64,
    /// Decisions per iteration before it is abandoned as inconclusive
    /// (default 10 000).
    pub max_steps: u64,
    /// Scheduling strategy (default random).
    pub strategy: StrategyKind,
    /// Master seed from which every iteration seed is derived (default 0).
    pub seed: u64,
    /// When set, replay this trace instead of exploring.
    pub replay: Option<Trace>,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            max_steps: DEFAULT_MAX_STEPS,
            strategy: StrategyKind::default(),
            seed: 0,
            replay: None,
        }
    }
}

impl ExplorationConfig {
    /// Set the iteration budget.
    #[must_use]
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the per-iteration step bound.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the master seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replay `trace` instead of exploring.
    #[must_use]
    pub fn with_replay(mut self, trace: Trace) -> Self {
        self.replay = Some(trace);
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.max_steps == 0 {
            return Err(ConfigError::ZeroMaxSteps);
        }
        if let StrategyKind::Priority { change_points: 0 } = self.strategy {
            return Err(ConfigError::InvalidChangePoints(0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ExplorationConfig::default();
        assert_eq!(config.iterations, 100);
        assert_eq!(config.max_steps, 10_000);
        assert_eq!(config.strategy, StrategyKind::Random);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_budgets() {
        assert_eq!(
            ExplorationConfig::default().with_iterations(0).validate(),
            Err(ConfigError::ZeroIterations)
        );
        assert_eq!(
            ExplorationConfig::default().with_max_steps(0).validate(),
            Err(ConfigError::ZeroMaxSteps)
        );
    }

    #[test]
    fn rejects_priority_without_change_points() {
        let config =
            ExplorationConfig::default().with_strategy(StrategyKind::Priority { change_points: 0 });
        assert_eq!(config.validate(), Err(ConfigError::InvalidChangePoints(0)));
    }
}
