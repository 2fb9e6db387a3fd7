//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Strata - Declarative template-driven infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the engine configuration file.
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the template.
    #[arg(short, long, global = true, env = "STRATA_TEMPLATE", default_value = "template.yaml")]
    pub template: PathBuf,

    /// Parameter override, as `Name=Value`. May be repeated.
    #[arg(short, long = "param", global = true, value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log line format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the template and parameters without touching resources.
    Validate,

    /// Compute and display the plan.
    Plan {
        /// Show field-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Compute and execute the plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Keep running steps that do not depend on a failed one.
        #[arg(long)]
        continue_independent: bool,

        /// Maximum concurrent provider operations.
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Delete every resource in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the stack outputs recorded in state.
    Outputs,

    /// Inspect or repair the state store.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Release the state lease.
    Unlock {
        /// Release even if the lease is held and unexpired.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// JSON log lines.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parameter overrides as a map. Later occurrences win.
    #[must_use]
    pub fn parameter_overrides(&self) -> BTreeMap<String, String> {
        self.params.iter().cloned().collect()
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_string(), value.to_string())),
        _ => Err(format!("expected Name=Value, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("Port=8080").unwrap(),
            (String::from("Port"), String::from("8080"))
        );
        assert_eq!(
            parse_param("Cidrs=10.0.0.0/16,10.1.0.0/16").unwrap().1,
            "10.0.0.0/16,10.1.0.0/16"
        );
        assert_eq!(parse_param("Empty=").unwrap().1, "");
        assert!(parse_param("Port").is_err());
        assert!(parse_param("=80").is_err());
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "strata",
            "apply",
            "--yes",
            "--continue-independent",
            "--max-workers",
            "2",
            "-p",
            "Env=prod",
            "-p",
            "Env=test",
        ])
        .unwrap();

        assert_eq!(cli.parameter_overrides()["Env"], "test");
        assert_eq!(cli.template, PathBuf::from("template.yaml"));
        match cli.command {
            Commands::Apply {
                yes,
                continue_independent,
                max_workers,
            } => {
                assert!(yes);
                assert!(continue_independent);
                assert_eq!(max_workers, Some(2));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_state_unlock() {
        let cli = Cli::try_parse_from(["strata", "--output", "json", "state", "unlock", "--force"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true }
            }
        ));
    }
}
