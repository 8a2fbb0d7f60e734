//! infermuxd - the inference runtime host process.
//!
//! Loads configuration from the environment, boots the runtime, and
//! serves until SIGINT/SIGTERM. Exit code 0 on clean shutdown, 1 on
//! fatal startup errors (unusable configuration or models root).

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use infermux::observability::init_logging;
use infermux::{ModelRuntime, RuntimeConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    init_logging(&config);

    let runtime = match ModelRuntime::new(config) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "runtime setup failed");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = runtime.start().await {
        error!(error = %e, "startup failed");
        return ExitCode::from(1);
    }

    wait_for_signal().await;
    info!("shutdown signal received");

    runtime.shutdown().await;
    ExitCode::SUCCESS
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
