//! Agent Eval
//!
//! Runs an untrusted coding agent against a sanitized copy of a repository's
//! history, collects the patch it produces, and puts the repository back.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use ae_common::config::{AppConfig, CliOverrides};
use ae_common::logging::{LogFormat, LoggingConfig, init_logging};
use ae_common::{CancelToken, LifecycleError};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

/// Exit codes.
pub const EXIT_OK: u8 = 0;
pub const EXIT_NO_PATCH: u8 = 1;
pub const EXIT_RESTORE_FAILED: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "ae")]
#[command(author, version, about = "Agent Eval - run a coding agent against a sanitized workspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,
}

/// Where the starting point comes from.
#[derive(Args, Debug, Clone)]
pub struct SetupArgs {
    /// Workspace directory (cloned from --source when missing)
    #[arg(short = 'd', long)]
    pub workspace: PathBuf,

    /// Repository URL or path to clone into a missing workspace
    #[arg(long)]
    pub source: Option<String>,

    /// Branch to check out before preparing (e.g. `pr_123`)
    #[arg(long)]
    pub branch: Option<String>,

    /// Ground-truth patch to reverse-apply: a file path or an http(s) URL
    #[arg(long)]
    pub gt_patch: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct WorkspaceArg {
    /// Workspace directory
    #[arg(short = 'd', long)]
    pub workspace: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare, run the agent, extract its patch, restore
    Run {
        #[command(flatten)]
        setup: SetupArgs,

        /// Prompt file (markdown)
        #[arg(short = 'f', long)]
        prompt: PathBuf,

        /// Where to write the patch and trajectory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Fresh sessions to try before giving up
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Model as `provider/model`
        #[arg(long)]
        model: Option<String>,
    },

    /// Provision and sanitize a workspace, print the baseline commit
    Prepare {
        #[command(flatten)]
        setup: SetupArgs,
    },

    /// Return a workspace to its state before `prepare`
    Reset {
        #[command(flatten)]
        target: WorkspaceArg,
    },

    /// Reset, then remove what `prepare` created
    Cleanup {
        #[command(flatten)]
        target: WorkspaceArg,
    },

    /// Print the recorded state of a workspace
    Status {
        #[command(flatten)]
        target: WorkspaceArg,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let overrides = match &cli.command {
        Commands::Run {
            output_dir,
            max_attempts,
            model,
            ..
        } => CliOverrides {
            max_attempts: *max_attempts,
            output_dir: output_dir.clone(),
            log_level: None,
            model: model.clone(),
        },
        _ => CliOverrides::default(),
    };
    let overrides = CliOverrides {
        log_level: cli.verbose.then(|| "debug".to_string()),
        ..overrides
    };

    let config = match load_config(cli.config.as_deref(), &overrides) {
        Ok(c) => c,
        Err(e) => {
            init_logging(&LoggingConfig::default());
            return ExitCode::from(report_error(&e));
        }
    };
    init_logging(&LoggingConfig {
        level: config.harness.log_level.value.clone(),
        format: cli.log_format,
    });

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("interrupt received; finishing current step and restoring workspace");
        handler_token.cancel();
    }) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let result = match cli.command {
        Commands::Run { setup, prompt, .. } => commands::run::run(&setup, &prompt, &config, cancel),
        Commands::Prepare { setup } => commands::lifecycle::prepare(&setup, &config, cancel),
        Commands::Reset { target } => commands::lifecycle::reset(&target.workspace, &config, cancel),
        Commands::Cleanup { target } => commands::lifecycle::cleanup(&target.workspace, &config, cancel),
        Commands::Status { target } => commands::lifecycle::status(&target.workspace, &config),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => ExitCode::from(report_error(&e)),
    }
}

fn load_config(path: Option<&std::path::Path>, overrides: &CliOverrides) -> Result<AppConfig> {
    let mut config = AppConfig::load(path)
        .map_err(LifecycleError::from)
        .context("failed to load configuration")?;
    config.apply_cli(overrides);
    config
        .validate()
        .map_err(LifecycleError::from)
        .context("invalid command-line options")?;
    Ok(config)
}

/// Print the error with its catalog entry; returns the exit code.
fn report_error(err: &anyhow::Error) -> u8 {
    let Some(lifecycle) = err.chain().find_map(|e| e.downcast_ref::<LifecycleError>()) else {
        eprintln!("error: {:#}", err);
        return EXIT_NO_PATCH;
    };
    let entry = lifecycle.code().entry();
    eprintln!("error[{}]: {:#}", entry.code, err);
    for step in &entry.remediation {
        eprintln!("  - {}", step);
    }
    exit_code_for(lifecycle)
}

pub fn exit_code_for(err: &LifecycleError) -> u8 {
    if matches!(err, LifecycleError::Cancelled) {
        EXIT_CANCELLED
    } else if err.needs_manual_intervention() {
        EXIT_RESTORE_FAILED
    } else {
        EXIT_NO_PATCH
    }
}
