//! Deterministic replay of a recorded trace.

use super::{SchedulingContext, Strategy, StrategyFactory};
use crate::{
    error::ReplayMismatch,
    operation::OperationId,
    trace::{Choice, ChoiceKind, Decision, Trace},
};

/// Returns the decisions of a recorded trace instead of computing new ones.
///
/// Replay is strict: at every step the recorded operation must be enabled
/// and the live enabled set must equal the recorded snapshot. Choices must be
/// requested in the recorded order with the recorded kinds and bounds.
#[derive(Debug, Clone)]
pub struct ReplayStrategy {
    trace: Trace,
    /// Index of the decision whose turn is executing.
    current: Option<usize>,
    /// Next unconsumed choice within the current decision.
    next_choice: usize,
}

impl ReplayStrategy {
    /// Replay `trace`.
    pub fn new(trace: Trace) -> Self {
        Self { trace, current: None, next_choice: 0 }
    }

    fn current_decision(&self) -> Option<&Decision> {
        self.current.and_then(|i| self.trace.decisions().get(i))
    }

    fn next_recorded_choice(&self) -> Option<Choice> {
        self.current_decision().and_then(|d| d.choices.get(self.next_choice).copied())
    }

    /// Recorded choices of the current decision the program never asked for.
    fn check_choices_consumed(&self, step: u64) -> Result<(), ReplayMismatch> {
        match self.next_recorded_choice() {
            Some(choice) => Err(ReplayMismatch::UnusedChoices { step, unused: choice.kind() }),
            None => Ok(()),
        }
    }
}

impl Strategy for ReplayStrategy {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn choose_operation(
        &mut self,
        cx: &SchedulingContext<'_>,
    ) -> Result<OperationId, ReplayMismatch> {
        self.check_choices_consumed(cx.step.saturating_sub(1))?;

        let decision =
            self.trace.get(cx.step).ok_or(ReplayMismatch::TraceExhausted { step: cx.step })?;

        if !cx.enabled.contains(&decision.chosen) {
            return Err(ReplayMismatch::NotEnabled {
                step: cx.step,
                expected: decision.chosen,
                enabled: cx.enabled.to_vec(),
            });
        }

        if decision.enabled != cx.enabled {
            return Err(ReplayMismatch::EnabledSetDiverged {
                step: cx.step,
                recorded: decision.enabled.clone(),
                live: cx.enabled.to_vec(),
            });
        }

        let chosen = decision.chosen;
        self.current = usize::try_from(cx.step).ok();
        self.next_choice = 0;
        Ok(chosen)
    }

    fn choose_boolean(&mut self, step: u64) -> Result<bool, ReplayMismatch> {
        match self.next_recorded_choice() {
            Some(Choice::Boolean(value)) => {
                self.next_choice += 1;
                Ok(value)
            },
            other => Err(ReplayMismatch::ChoiceDiverged {
                step,
                expected: other.map(|c| c.kind()),
                actual: ChoiceKind::Boolean,
            }),
        }
    }

    fn choose_integer(&mut self, step: u64, bound: u64) -> Result<u64, ReplayMismatch> {
        match self.next_recorded_choice() {
            Some(Choice::Integer { bound: recorded, value }) if recorded == bound => {
                self.next_choice += 1;
                Ok(value)
            },
            other => Err(ReplayMismatch::ChoiceDiverged {
                step,
                expected: other.map(|c| c.kind()),
                actual: ChoiceKind::Integer,
            }),
        }
    }

    fn finish(&mut self, steps: u64) -> Result<(), ReplayMismatch> {
        self.check_choices_consumed(steps.saturating_sub(1))?;

        let recorded = self.trace.len() as u64;
        if steps != recorded {
            return Err(ReplayMismatch::TraceNotConsumed { consumed: steps, recorded });
        }
        Ok(())
    }
}

/// Factory handing out the same replay for every iteration.
#[derive(Debug, Clone)]
pub struct ReplayFactory {
    trace: Trace,
}

impl ReplayFactory {
    /// Factory replaying `trace`.
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

impl StrategyFactory for ReplayFactory {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn create(&mut self, _iteration: u64, _seed: u64) -> Box<dyn Strategy> {
        Box::new(ReplayStrategy::new(self.trace.clone()))
    }
}
