//! Engine instances under test
//!
//! Each participant in a scenario owns exactly one engine process and one
//! captured-output sink for the whole run. Handles are never reused across
//! scenarios.

mod handle;
mod state;

pub use handle::{ClientHandle, ClientSpec};
pub use state::ClientState;
