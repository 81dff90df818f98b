//! Spaceway E2E - black-box scenario runner for the Spaceway engine
//!
//! This library drives independent engine processes through scripted
//! scenarios and scores what they log. The engine is never linked; it is
//! only ever observed through its stdin and its merged output stream.

pub mod cli;
pub mod client;
pub mod commands;
pub mod common;
pub mod facts;
pub mod report;
pub mod scoring;
pub mod sequencer;
pub mod teardown;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use scoring::{ScenarioResult, Verdict};
pub use testing::{Scenario, ScenarioRunner};
