//! # modelops - Model Lifecycle Control Plane
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     apps/modelops (THE BINARY)                   │
//! │                                                                  │
//! │  ┌──────────┐  ┌──────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │   CLI    │  │   Monitor    │  │ Supervisor │  │  Serving   │  │
//! │  │  (clap)  │  │ (tokio task) │  │ (OS procs) │  │ shell/axum │  │
//! │  └────┬─────┘  └──────┬───────┘  └─────┬──────┘  └────────────┘  │
//! │       └───────────────┼────────────────┘                         │
//! │                       ▼                                          │
//! │               ┌────────────────┐                                 │
//! │               │ modelops-core  │                                 │
//! │               │  (THE LOGIC)   │                                 │
//! │               └────────────────┘                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! TRAIN_COMMAND="python train.py" modelops pipeline
//! modelops status
//! modelops rollback
//! modelops monitor start
//! ```

use clap::Parser;
use modelops::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // MODELOPS_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("MODELOPS_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "modelops=info,modelops_core=info,tower_http=debug".into());

    // Logs go to stderr so `--json-mode` output on stdout stays parseable.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        "modelops v{} - model lifecycle control plane\n",
        env!("CARGO_PKG_VERSION")
    );
}
