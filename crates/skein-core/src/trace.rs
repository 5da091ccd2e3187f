//! Execution traces: recording, inspection and persistence.
//!
//! A trace is the ordered list of scheduling decisions made during one
//! iteration. Each decision carries the enabled-set snapshot it was made
//! against and every nondeterministic choice resolved while the chosen
//! operation ran, so replay can detect a program that no longer behaves the
//! same way.
//!
//! # Persisted format
//!
//! [`TraceArtifact`] wraps a trace with the metadata needed to reproduce it
//! (strategy, seeds, the violation it exposes) and is encoded as CBOR. The
//! envelope carries a format version; readers reject versions they do not
//! understand instead of guessing.

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::{checker::Violation, error::TraceError, operation::OperationId};

/// Format version written by this build.
pub const TRACE_FORMAT_VERSION: u16 = 1;

/// Kind of a nondeterministic choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChoiceKind {
    /// `choose_boolean`.
    Boolean,
    /// `choose_integer`.
    Integer,
}

/// A resolved nondeterministic choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    /// Boolean choice.
    Boolean(bool),
    /// Integer choice in `0..bound`.
    Integer {
        /// Exclusive upper bound requested by the program.
        bound: u64,
        /// Value returned.
        value: u64,
    },
}

impl Choice {
    /// Kind of this choice.
    pub fn kind(&self) -> ChoiceKind {
        match self {
            Self::Boolean(_) => ChoiceKind::Boolean,
            Self::Integer { .. } => ChoiceKind::Integer,
        }
    }
}

/// One scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Zero-based step index within the iteration.
    pub step: u64,
    /// Operation resumed at this step.
    pub chosen: OperationId,
    /// Enabled operations at the time of the decision, in id order.
    pub enabled: Vec<OperationId>,
    /// Choices resolved while `chosen` ran, in call order.
    pub choices: Vec<Choice>,
}

/// Ordered decision log of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    decisions: Vec<Decision>,
}

impl Trace {
    /// Build a trace from decisions.
    pub fn from_decisions(decisions: Vec<Decision>) -> Self {
        Self { decisions }
    }

    /// Recorded decisions.
    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// Decision at `step`.
    pub fn get(&self, step: u64) -> Option<&Decision> {
        usize::try_from(step).ok().and_then(|i| self.decisions.get(i))
    }

    /// Number of decisions.
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    /// True if no decision was recorded.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Sequence of chosen operations, the schedule in its most compact form.
    pub fn schedule(&self) -> Vec<OperationId> {
        self.decisions.iter().map(|d| d.chosen).collect()
    }

    /// Number of decisions at which the chosen operation differs from the
    /// previous one while the previous one was still enabled.
    pub fn preemptions(&self) -> usize {
        self.decisions
            .windows(2)
            .filter(|w| w[0].chosen != w[1].chosen && w[1].enabled.contains(&w[0].chosen))
            .count()
    }
}

/// Appends decisions as the controller consults the strategy.
#[derive(Debug, Default)]
pub(crate) struct TraceRecorder {
    decisions: Vec<Decision>,
}

impl TraceRecorder {
    pub(crate) fn record_decision(
        &mut self,
        step: u64,
        chosen: OperationId,
        enabled: Vec<OperationId>,
    ) {
        tracing::trace!(step, %chosen, ?enabled, "decision");
        self.decisions.push(Decision { step, chosen, enabled, choices: Vec::new() });
    }

    /// Attach a choice to the decision currently being executed.
    pub(crate) fn record_choice(&mut self, choice: Choice) {
        if let Some(current) = self.decisions.last_mut() {
            tracing::trace!(step = current.step, ?choice, "choice");
            current.choices.push(choice);
        }
    }

    pub(crate) fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub(crate) fn finish(self) -> Trace {
        Trace { decisions: self.decisions }
    }
}

/// Persisted, self-describing reproduction of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceArtifact {
    /// Format version, see [`TRACE_FORMAT_VERSION`].
    pub version: u16,
    /// Strategy that produced the trace.
    pub strategy: String,
    /// Master seed of the exploration.
    pub master_seed: u64,
    /// Zero-based iteration index.
    pub iteration: u64,
    /// Seed derived for that iteration.
    pub iteration_seed: u64,
    /// Program the trace was recorded against, if known.
    pub scenario: Option<String>,
    /// Violation the trace reproduces, if any.
    pub violation: Option<Violation>,
    /// Decision log.
    pub trace: Trace,
}

/// Leading field of every envelope version.
#[derive(Deserialize)]
struct Header {
    version: u16,
}

impl TraceArtifact {
    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TraceError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| TraceError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR, rejecting unknown format versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TraceError> {
        Self::read_from(bytes)
    }

    /// Decode from a reader.
    ///
    /// The version is read before the rest of the envelope, so an artifact
    /// from another format version is reported as such even when its body
    /// no longer decodes.
    pub fn read_from(mut reader: impl io::Read) -> Result<Self, TraceError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let header: Header =
            ciborium::from_reader(bytes.as_slice()).map_err(|e| TraceError::Decode(e.to_string()))?;
        if header.version != TRACE_FORMAT_VERSION {
            return Err(TraceError::UnsupportedVersion {
                found: header.version,
                expected: TRACE_FORMAT_VERSION,
            });
        }

        ciborium::from_reader(bytes.as_slice()).map_err(|e| TraceError::Decode(e.to_string()))
    }

    /// Tag the artifact with the program it was recorded against.
    #[must_use]
    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    /// Write to a file, replacing it.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Read from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let file = fs::File::open(path)?;
        Self::read_from(io::BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u64) -> OperationId {
        OperationId::new(n)
    }

    fn sample() -> Trace {
        let mut recorder = TraceRecorder::default();
        recorder.record_decision(0, op(0), vec![op(0)]);
        recorder.record_decision(1, op(1), vec![op(0), op(1)]);
        recorder.record_choice(Choice::Boolean(true));
        recorder.record_choice(Choice::Integer { bound: 4, value: 3 });
        recorder.record_decision(2, op(0), vec![op(0), op(1)]);
        recorder.finish()
    }

    #[test]
    fn choices_attach_to_current_decision() {
        let trace = sample();
        assert_eq!(trace.len(), 3);
        assert!(trace.decisions()[0].choices.is_empty());
        assert_eq!(
            trace.decisions()[1].choices,
            vec![Choice::Boolean(true), Choice::Integer { bound: 4, value: 3 }]
        );
        assert_eq!(trace.schedule(), vec![op(0), op(1), op(0)]);
    }

    #[test]
    fn choice_before_any_decision_is_dropped() {
        let mut recorder = TraceRecorder::default();
        recorder.record_choice(Choice::Boolean(false));
        assert!(recorder.finish().is_empty());
    }

    #[test]
    fn preemptions_count_switches_away_from_enabled_operations() {
        // op0 -> op1 while op0 enabled (preemption), op1 -> op0 while op1 enabled.
        assert_eq!(sample().preemptions(), 2);
    }

    #[test]
    fn artifact_rejects_unknown_version() {
        let artifact = TraceArtifact {
            version: TRACE_FORMAT_VERSION + 1,
            strategy: "random".to_string(),
            master_seed: 1,
            iteration: 0,
            iteration_seed: 2,
            scenario: None,
            violation: None,
            trace: sample(),
        };
        let bytes = artifact.to_bytes().expect("encode");

        let err = TraceArtifact::from_bytes(&bytes).expect_err("version must be rejected");
        assert!(matches!(err, TraceError::UnsupportedVersion { found: 2, expected: 1 }));
    }

    #[test]
    fn artifact_survives_encoding() {
        let artifact = TraceArtifact {
            version: TRACE_FORMAT_VERSION,
            strategy: "pct".to_string(),
            master_seed: 99,
            iteration: 7,
            iteration_seed: 1234,
            scenario: Some("counter-race".to_string()),
            violation: Some(Violation::AssertionViolation {
                operation: op(1),
                message: "lost update".to_string(),
            }),
            trace: sample(),
        };

        let decoded = TraceArtifact::from_bytes(&artifact.to_bytes().expect("encode"))
            .expect("decode");
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn version_is_checked_before_the_body() {
        #[derive(Serialize)]
        struct NextVersion {
            version: u16,
            schedule: Vec<String>,
        }

        let future =
            NextVersion { version: TRACE_FORMAT_VERSION + 1, schedule: vec!["op0".to_string()] };
        let mut bytes = Vec::new();
        ciborium::into_writer(&future, &mut bytes).expect("encode");

        let err = TraceArtifact::from_bytes(&bytes).expect_err("version must be rejected");
        assert!(matches!(err, TraceError::UnsupportedVersion { found: 2, expected: 1 }), "{err}");
    }

    #[test]
    fn scenario_tag_survives_encoding() {
        let artifact = TraceArtifact {
            version: TRACE_FORMAT_VERSION,
            strategy: "random".to_string(),
            master_seed: 0,
            iteration: 0,
            iteration_seed: 0,
            scenario: None,
            violation: None,
            trace: sample(),
        }
        .with_scenario("lock-order");

        let decoded = TraceArtifact::from_bytes(&artifact.to_bytes().expect("encode"))
            .expect("decode");
        assert_eq!(decoded.scenario.as_deref(), Some("lock-order"));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = TraceArtifact::from_bytes(&[0xff, 0x00, 0x13]).expect_err("not CBOR");
        assert!(matches!(err, TraceError::Decode(_)));
    }
}
