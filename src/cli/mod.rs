//! Command-line interface for fleetforge.
//!
//! Provides the `serve` composition-root command plus `decide`/`status`
//! one-shot diagnostic commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
