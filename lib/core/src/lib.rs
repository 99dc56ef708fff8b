//! Core domain types for the trendline pipeline orchestrator.
//!
//! Identifiers, agent names, time windows and run states shared by the
//! pipeline description and the scheduler.

pub mod error;
pub mod id;
pub mod state;
pub mod window;

pub use error::Result;
pub use id::{AgentName, AlertId, ParseIdError, TaskRunId};
pub use state::RunState;
pub use window::{InvalidWindowError, TimeWindow};
