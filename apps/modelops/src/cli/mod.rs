//! # modelops CLI Module
//!
//! ## Available Commands
//!
//! - `setup` - Create working directories and initialise the tracking store
//! - `data` - Run the dataset preparation command
//! - `train` - Train and register a new version
//! - `serve` - Run the serving shell for one stage (launched by the supervisor)
//! - `test` - Smoke-check the running serving processes
//! - `pipeline` - setup, data, train, staging, promote
//! - `staging` / `promote` / `rollback` - Deployment transitions
//! - `status` - Registry state plus live processes
//! - `reconcile` - Bring serving processes in line with the registry
//! - `monitor start|performance|drift|retrain` - Health monitoring

mod commands;

use crate::config::Settings;
use clap::{Parser, Subcommand};
use modelops_core::{ModelName, OpsError};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// modelops - model lifecycle control plane
///
/// Trains, stages, promotes, rolls back and monitors one predictive model,
/// supervising its staging and production serving processes.
#[derive(Parser, Debug)]
#[command(name = "modelops")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// TOML settings file (environment variables take precedence)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Model name, overriding MODEL_NAME
    #[arg(short, long, global = true)]
    pub model: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create working directories and initialise the tracking store
    Setup,

    /// Run the dataset preparation command
    Data,

    /// Train and register a new model version
    Train,

    /// Run the serving shell for one stage
    Serve {
        /// Stage served by this process (defaults to MODEL_STAGE)
        #[arg(short, long)]
        stage: Option<String>,

        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to (defaults to the stage's configured port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Version being served
        #[arg(long)]
        version: Option<String>,
    },

    /// Smoke-check /health of the running serving processes
    Test,

    /// Run setup, data, train, staging and promote in order
    Pipeline,

    /// Deploy the latest registered version to staging
    Staging,

    /// Promote the staging version to production
    Promote,

    /// Restore the previous production version
    Rollback,

    /// Show registry state and serving processes
    Status,

    /// Restart or stop serving processes to match the registry
    Reconcile,

    /// Health monitoring
    Monitor {
        #[command(subcommand)]
        action: MonitorCommand,
    },
}

/// Monitoring subcommands.
#[derive(Subcommand, Debug)]
pub enum MonitorCommand {
    /// Run the monitor loop until Ctrl+C
    Start {
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Evaluate performance over the configured window
    Performance,

    /// Compare reference and current feature distributions
    Drift,

    /// Retrain and redeploy immediately
    Retrain,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), OpsError> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(name) = cli.model {
        settings.model_name = ModelName::new(name)?;
    }
    if cli.verbose {
        tracing::debug!(?settings, "effective settings");
    }
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Setup) => cmd_setup(&settings, json_mode).await,
        Some(Commands::Data) => cmd_data(&settings, json_mode).await,
        Some(Commands::Train) => cmd_train(&settings, json_mode).await,
        Some(Commands::Serve {
            stage,
            host,
            port,
            version,
        }) => cmd_serve(&settings, stage.as_deref(), &host, port, version.as_deref()).await,
        Some(Commands::Test) => cmd_test(&settings, json_mode).await,
        Some(Commands::Pipeline) => cmd_pipeline(&settings, json_mode).await,
        Some(Commands::Staging) => cmd_staging(&settings, json_mode).await,
        Some(Commands::Promote) => cmd_promote(&settings, json_mode).await,
        Some(Commands::Rollback) => cmd_rollback(&settings, json_mode).await,
        Some(Commands::Reconcile) => cmd_reconcile(&settings, json_mode).await,
        Some(Commands::Monitor { action }) => match action {
            MonitorCommand::Start { ticks } => cmd_monitor_start(&settings, ticks).await,
            MonitorCommand::Performance => cmd_monitor_performance(&settings, json_mode).await,
            MonitorCommand::Drift => cmd_monitor_drift(&settings, json_mode).await,
            MonitorCommand::Retrain => cmd_monitor_retrain(&settings, json_mode).await,
        },
        // No subcommand - show status by default
        Some(Commands::Status) | None => cmd_status(&settings, json_mode).await,
    }
}
