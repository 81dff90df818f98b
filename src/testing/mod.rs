//! Declarative E2E scenarios
//!
//! Scenarios are YAML files describing a participant roster, setup and
//! action steps, and the assertions scored at the end. One runner executes
//! all of them; nothing scenario-specific lives in code.

mod bindings;
mod checks;
mod config;
mod runner;

pub use bindings::{variables, Bindings};
pub use checks::{evaluate, Checkpoint, Observed, Outcome, SentMessage};
pub use config::*;
pub use runner::ScenarioRunner;
