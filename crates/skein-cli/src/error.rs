//! CLI error types.

use thiserror::Error;

/// Errors specific to the command-line driver.
#[derive(Debug, Error)]
pub enum CliError {
    /// The trace file was recorded against another scenario.
    #[error("trace was recorded for scenario '{recorded}', not '{requested}'")]
    ScenarioMismatch {
        /// Scenario named in the trace file.
        recorded: String,
        /// Scenario given on the command line.
        requested: String,
    },
}
