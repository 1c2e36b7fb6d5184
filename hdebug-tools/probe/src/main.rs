//! hdebug probe binary
//!
//! Run with: `hdebug-probe [COMMAND]`
//!
//! Runs a named handle-misuse scenario against a fresh debug context and
//! exits with the context's status: 0 when the scenario completes, the
//! fatal exit code when a violation terminates it with no hook installed.

mod scenario;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use hdebug_runtime::{
    DebugConfig, DebugContext, RecordingHook, Violation, ViolationCounts, FATAL_EXIT_CODE,
};

use scenario::Scenario;

#[derive(Parser)]
#[command(name = "hdebug-probe")]
#[command(about = "Run handle-misuse scenarios against the debug context")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scenario
    Run {
        /// Scenario to run
        #[arg(value_enum)]
        scenario: Scenario,

        /// Violation policy for the run
        #[arg(long, value_enum, default_value_t = HookMode::None)]
        hook: HookMode,

        /// Closed slots kept out of reuse (overrides HDEBUG_CLOSED_QUARANTINE)
        #[arg(long)]
        quarantine: Option<usize>,

        /// Exit status of the fatal path (overrides HDEBUG_FATAL_EXIT_CODE)
        #[arg(long)]
        exit_code: Option<i32>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available scenarios
    List,
}

/// Hook installed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HookMode {
    /// No hook: the first violation terminates the process.
    None,
    /// Record every violation and continue.
    Record,
}

#[derive(Serialize)]
struct RunReport {
    scenario: &'static str,
    counts: ViolationCounts,
    violations: Vec<Violation>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DebugConfig::from_env();

    // Initialize logging
    let filter = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            hook,
            quarantine,
            exit_code,
            json,
        } => {
            if let Some(len) = quarantine {
                config.closed_quarantine = len;
            }
            if let Some(code) = exit_code {
                config.fatal_exit_code = code;
            }
            config.validate().context("invalid probe configuration")?;
            cmd_run(config, scenario, hook, json)
        }
        Commands::List => cmd_list(),
    }
}

fn cmd_run(config: DebugConfig, scenario: Scenario, mode: HookMode, json: bool) -> Result<()> {
    tracing::debug!(scenario = scenario.name(), ?mode, "running scenario");
    let ctx: DebugContext<scenario::Value> = DebugContext::with_config(config);

    let recorder = Arc::new(RecordingHook::new());
    let session = match mode {
        HookMode::None => None,
        HookMode::Record => Some(
            ctx.hook_session(recorder.clone())
                .context("failed to install recording hook")?,
        ),
    };

    scenario
        .run(&ctx)
        .with_context(|| format!("scenario `{}` failed", scenario.name()))?;
    ctx.teardown();

    let report = RunReport {
        scenario: scenario.name(),
        counts: ctx.violation_counts(),
        violations: recorder.violations(),
    };
    drop(session);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        println!("{}: {}", report.scenario, report.counts);
        for violation in &report.violations {
            println!("  {}", violation);
        }
    }
    Ok(())
}

fn cmd_list() -> Result<()> {
    println!("Scenarios (fatal exit code {}):", FATAL_EXIT_CODE);
    for scenario in Scenario::ALL {
        println!("  {:<18} {}", scenario.name(), scenario.description());
    }
    Ok(())
}
