//! Command-line interface for taskforge.
//!
//! Provides commands for running an in-process simulation of the engine
//! and for checking classifier rule tables against sample errors.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
