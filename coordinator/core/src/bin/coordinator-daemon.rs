//! Coordinator Daemon
//!
//! Standalone coordinator process. Workers connect over TCP with
//! length-prefixed JSON frames; the HTTP boundary embeds against the
//! library API.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:7440, in-memory state)
//! coordinator-daemon
//!
//! # Persist state and listen on all interfaces
//! IRIS_STATE_DIR=/var/lib/iris IRIS_BIND=0.0.0.0:7440 coordinator-daemon
//!
//! # With verbose logging
//! RUST_LOG=debug coordinator-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `IRIS_BIND`: listen address for worker connections (default
//!   `127.0.0.1:7440`)
//! - `IRIS_STATE_DIR`: directory for persisted reputation, node metadata,
//!   and task history (default: in-memory only)
//! - `IRIS_ACCOUNTS_FILE`: JSON file of account records issued by the
//!   account service
//! - `IRIS_*`: every tunable in `CoordinatorConfig::from_env`
//! - `RUST_LOG`: log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! SIGTERM/SIGINT: graceful shutdown (cancels in-flight tasks, flushes the
//! reputation snapshot).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};

use coordinator_core::{
    AccountDirectory, AccountRecord, Coordinator, CoordinatorConfig, WorkerListener,
};

fn load_accounts() -> AccountDirectory {
    let directory = AccountDirectory::new();

    let Ok(path) = std::env::var("IRIS_ACCOUNTS_FILE") else {
        warn!("IRIS_ACCOUNTS_FILE not set, no worker can register");
        return directory;
    };

    match std::fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str::<Vec<AccountRecord>>(&data) {
            Ok(records) => {
                for record in records {
                    directory.insert(record);
                }
                info!(path = %path, accounts = directory.len(), "accounts loaded");
            }
            Err(e) => error!(path = %path, error = %e, "accounts file is not valid JSON"),
        },
        Err(e) => error!(path = %path, error = %e, "accounts file unreadable"),
    }

    directory
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coordinator_core=info".parse()?)
                .add_directive("coordinator_daemon=info".parse()?),
        )
        .with_target(true)
        .init();

    info!("starting coordinator daemon");
    info!(pid = std::process::id(), "process started");

    let bind: SocketAddr = std::env::var("IRIS_BIND")
        .unwrap_or_else(|_| "127.0.0.1:7440".to_string())
        .parse()?;

    let config = CoordinatorConfig::from_env();
    let mut builder = Coordinator::builder(config).accounts(load_accounts());
    if let Ok(dir) = std::env::var("IRIS_STATE_DIR") {
        builder = builder.state_dir(dir);
    }

    let coordinator = Arc::new(builder.build());
    let sweepers = coordinator.spawn_sweepers();
    info!("coordinator services started");

    let listener = WorkerListener::bind(bind).await.map_err(|e| {
        error!(addr = %bind, error = %e, "failed to bind worker listener");
        anyhow::anyhow!("failed to bind {bind}: {e}")
    })?;

    let accept_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            listener.run(coordinator).await;
        })
    };

    // Wait for a shutdown signal.
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }

    accept_task.abort();
    for handle in sweepers {
        handle.abort();
    }
    coordinator.shutdown().await;

    info!("coordinator daemon stopped cleanly");
    Ok(())
}
