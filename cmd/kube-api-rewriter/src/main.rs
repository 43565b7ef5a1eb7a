//! Kubernetes API Rewriter
//!
//! Runs up to two rewriting proxies over one rule table:
//! - Client proxy: original-schema clients talk plain HTTP to
//!   `127.0.0.1:23915`, requests reach the API server renamed
//! - Webhook proxy: the API server calls `:24192`, reviews reach the
//!   original-schema webhook backend restored
//!
//! Plus the monitoring endpoints, and the runtime profiling endpoint when
//! `PPROF_BIND_ADDRESS` is set. All configuration comes from the environment.

mod config;
mod error;
mod logging;
mod monitoring;
mod runner;

use std::process::ExitCode;

use tracing::{error, info};

use crate::config::Config;
use crate::error::RunnerError;
use crate::runner::Runner;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "kube-api-rewriter stopped");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), RunnerError> {
    let config = Config::from_env()?;
    logging::init(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting kube-api-rewriter");
    Runner::new(&config).await?.run().await
}
