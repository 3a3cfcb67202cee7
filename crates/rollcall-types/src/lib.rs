//! Shared domain types for the Rollcall attendance client.

pub mod attendance;
pub mod config;
pub mod events;
pub mod frame;
pub mod telemetry;

mod errors;

pub use errors::{RollcallError, Result};
