//! Command line entry point: argument parsing, logging setup and dispatch to
//! the selected action.

pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod telemetry;

mod start;
pub use self::start::start;
