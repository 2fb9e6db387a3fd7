//! Command-line interface.
//!
//! Argument definitions and output rendering for the `strata` binary.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
