//! Error types for the scenario runner
//!
//! Only setup-phase failures abort a scenario. Everything that goes wrong
//! during the action and assertion phases is recorded and scored instead,
//! so most of these variants end up as log lines or report events rather
//! than early returns.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scenario runner
#[derive(Error, Debug)]
pub enum Error {
    // === Client Lifecycle Errors ===
    #[error("Failed to start engine for '{client}': {reason}")]
    ClientStartFailed { client: String, reason: String },

    #[error("Engine for '{client}' exited unexpectedly (exit code {code:?})")]
    ClientCrashed { client: String, code: Option<i32> },

    #[error("Cannot send to '{client}': {reason}")]
    CommunicationFailure { client: String, reason: String },

    #[error("Engine for '{client}' did not stop within {secs} seconds")]
    TeardownTimeout { client: String, secs: u64 },

    #[error("Engine executable '{0}' not found. Set [engine] executable in the config or pass --engine")]
    EngineNotFound(String),

    // === Scenario Errors ===
    #[error("Setup failed at step {step}: {reason}")]
    SetupFailure { step: usize, reason: String },

    #[error("Unknown participant '{0}'")]
    UnknownParticipant(String),

    #[error("Variable '{{{0}}}' is not bound")]
    UnboundVariable(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown fact '{0}'. Run 'spaceway-e2e patterns' to list the registry")]
    UnknownFact(String),

    #[error("Invalid scenario: {0}")]
    Scenario(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a setup failure for the given (1-based) step
    pub fn setup_failure(step: usize, reason: impl Into<String>) -> Self {
        Self::SetupFailure {
            step,
            reason: reason.into(),
        }
    }

    /// Create a communication failure for a client
    pub fn communication(client: &str, reason: impl Into<String>) -> Self {
        Self::CommunicationFailure {
            client: client.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a start failure for a client
    pub fn start_failed(client: &str, reason: impl Into<String>) -> Self {
        Self::ClientStartFailed {
            client: client.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_variable_message_keeps_braces() {
        let e = Error::UnboundVariable("bob.user_id".to_string());
        assert_eq!(e.to_string(), "Variable '{bob.user_id}' is not bound");
    }

    #[test]
    fn test_setup_failure_names_the_step() {
        let e = Error::setup_failure(3, "alice: no invite_code in output");
        assert_eq!(
            e.to_string(),
            "Setup failed at step 3: alice: no invite_code in output"
        );
    }
}
