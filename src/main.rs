// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use icingadb_sync::{logging, Config, Supervisor};

/// Synchronise Icinga monitoring data from Redis into SQL.
#[derive(Debug, Parser)]
#[command(name = "icingadb-sync", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/icingadb/config.toml")]
    config: PathBuf,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };
    logging::init(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "Starting");

    let mut supervisor = Supervisor::new(config);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            cancel.cancel();
        });
    }

    let result = match supervisor.start().await {
        Ok(()) => supervisor.run(cancel).await,
        Err(e) => Err(e),
    };
    supervisor.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(e.exit_code())
        }
    }
}
