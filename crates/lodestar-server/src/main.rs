//! Lodestar server binary.
//!
//! ```text
//! lodestar-server [--ip <addr>] [--port <1-65535>]
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

mod cli;

use std::process::ExitCode;

use clap::Parser;
use lodestar::Server;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging();

    let server = match Server::builder().bind(args.bind_addr()).build() {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "invalid server configuration");
            return ExitCode::from(1);
        }
    };

    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(addr = %args.bind_addr(), error = %e, "failed to start");
            return ExitCode::from(1);
        }
    };
    tracing::info!(%addr, version = env!("CARGO_PKG_VERSION"), "lodestar listening, ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c, shutting down");
    }

    tracing::info!("shutting down");
    server.stop().await;
    ExitCode::SUCCESS
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
