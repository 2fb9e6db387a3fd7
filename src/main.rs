//! Strata CLI entrypoint.
//!
//! This is the main entrypoint for the strata command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use strata::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use strata::config::{ConfigParser, ConfigValidator, EngineConfig};
use strata::engine::{Engine, LoadedTemplate};
use strata::error::Result;
use strata::planner::{FailureMode, Plan};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprint!("{}", formatter.format_error(&e));
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. Logs go to stderr so command output can
/// be piped.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let mut config = ConfigParser::new().load(cli.config.as_deref(), &cwd)?;

    if let Commands::Apply {
        continue_independent,
        max_workers,
        ..
    } = &cli.command
    {
        if *continue_independent {
            config.execution.failure_mode = FailureMode::ContinueIndependent;
        }
        if let Some(workers) = max_workers {
            config.execution.max_workers = *workers;
        }
    }

    let report = ConfigValidator::new().validate(&config)?;
    for warning in &report.warnings {
        warn!("{}", warning);
    }

    let engine = build_engine(&config).await?;
    let formatter = OutputFormatter::new(cli.output);
    let overrides = cli.parameter_overrides();

    match cli.command {
        Commands::Validate => cmd_validate(&engine, &cli.template, &overrides, formatter).await,
        Commands::Plan { detailed } => cmd_plan(&engine, &cli.template, &overrides, detailed, formatter).await,
        Commands::Apply { yes, .. } => cmd_apply(&engine, &cli.template, &overrides, yes, formatter).await,
        Commands::Destroy { yes } => cmd_destroy(&engine, yes, &formatter).await,
        Commands::Outputs => cmd_outputs(&engine, &cli.template, &overrides, formatter).await,
        Commands::State { command } => cmd_state(&engine, command, &formatter).await,
    }
}

/// Builds the engine and wires Ctrl-C to its cancellation token.
async fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let engine = Engine::from_config(config).await?;

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling and rolling back");
            token.cancel();
        }
    });

    Ok(engine)
}

fn secrets(plan: &Plan) -> Vec<String> {
    plan.context
        .as_ref()
        .map(|ctx| ctx.parameters.secret_values())
        .unwrap_or_default()
}

/// Validate the template.
async fn cmd_validate(
    engine: &Engine,
    template: &Path,
    overrides: &BTreeMap<String, String>,
    formatter: OutputFormatter,
) -> Result<()> {
    let loaded = LoadedTemplate::from_file(template)?;
    let plan = engine.validate(&loaded, overrides).await?;
    let formatter = formatter.with_secrets(secrets(&plan));
    print!("{}", formatter.format_validation(&plan));
    Ok(())
}

/// Show the plan.
async fn cmd_plan(
    engine: &Engine,
    template: &Path,
    overrides: &BTreeMap<String, String>,
    detailed: bool,
    formatter: OutputFormatter,
) -> Result<()> {
    let loaded = LoadedTemplate::from_file(template)?;
    let plan = engine.plan(&loaded, overrides).await?;
    let formatter = formatter.with_secrets(secrets(&plan));
    print!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Plan and apply.
async fn cmd_apply(
    engine: &Engine,
    template: &Path,
    overrides: &BTreeMap<String, String>,
    auto_approve: bool,
    formatter: OutputFormatter,
) -> Result<()> {
    let loaded = LoadedTemplate::from_file(template)?;
    let plan = engine.plan(&loaded, overrides).await?;
    let formatter = formatter.with_secrets(secrets(&plan));
    print!("{}", formatter.format_plan(&plan, false));

    if plan.has_changes() && !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let report = engine.apply_plan(&plan).await?;
    info!("Apply finished at state version {}", report.state_version);
    print!("{}", formatter.format_apply(&report));
    Ok(())
}

/// Destroy every resource in state.
async fn cmd_destroy(engine: &Engine, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let plan = engine.plan_destroy().await?;
    if !plan.has_changes() {
        print!("{}", formatter.success("No resources to destroy."));
        return Ok(());
    }

    print!("{}", formatter.format_plan(&plan, false));

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let report = engine.apply_plan(&plan).await?;
    print!("{}", formatter.format_apply(&report));
    Ok(())
}

/// Show outputs recorded in state.
async fn cmd_outputs(
    engine: &Engine,
    template: &Path,
    overrides: &BTreeMap<String, String>,
    formatter: OutputFormatter,
) -> Result<()> {
    let outputs = engine.outputs().await?;

    // NoEcho values come from the template, which may no longer be around.
    let secrets = match LoadedTemplate::from_file(template) {
        Ok(loaded) => match engine.validate(&loaded, overrides).await {
            Ok(plan) => secrets(&plan),
            Err(e) => {
                debug!("Not masking outputs: {}", e);
                Vec::new()
            }
        },
        Err(e) => {
            debug!("Not masking outputs: {}", e);
            Vec::new()
        }
    };

    print!("{}", formatter.with_secrets(secrets).format_outputs(&outputs));
    Ok(())
}

/// Manage state.
async fn cmd_state(engine: &Engine, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let store = engine.store();

    match command {
        StateCommands::Show => {
            let snapshot = store.load().await?;
            let lease = store.lease_info().await?;
            print!("{}", formatter.format_state(&snapshot, lease.as_ref()));
        }
        StateCommands::Unlock { force } => match store.lease_info().await? {
            None => print!("{}", formatter.success("State is not locked.")),
            Some(lease) if !force && !lease.is_expired() => {
                print!(
                    "{}",
                    formatter.warning(&format!(
                        "State is locked by {} for another {}s. Use --force to release it.",
                        lease.holder,
                        lease.remaining_secs()
                    ))
                );
            }
            Some(lease) => {
                store.force_release().await?;
                info!("Released lease {} held by {}", lease.lease_id, lease.holder);
                print!("{}", formatter.success("State lease released."));
            }
        },
    }

    Ok(())
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
