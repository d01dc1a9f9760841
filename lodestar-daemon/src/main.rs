use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lodestar_daemon::backend::LocalBackend;
use lodestar_daemon::config::Args;
use lodestar_daemon::server::Server;

/// Create the state directory with owner-only permissions (0o700).
fn ensure_state_dir(state_dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(state_dir)
            .with_context(|| format!("creating state directory {}", state_dir.display()))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory {}", state_dir.display()))?;
    }
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
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

        info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = args.server_config();
    info!("Starting lodestar daemon (platform {})", config.platform);
    if config.operator_uid.is_some() && config.platform.uses_named_pipes() {
        warn!("--operator has no effect on {}", config.platform);
    }

    let state_dir = args.state_dir()?;
    ensure_state_dir(&state_dir)?;

    let socket_path = args.socket_path()?;
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let server = Arc::new(Server::new(config.clone()));
    server.bind_backend(Arc::new(LocalBackend::open(
        state_dir,
        config.operator_uid.clone(),
    )));

    #[cfg(unix)]
    {
        let listener = lodestar_protocol::transport::UnixSocketListener::bind(&socket_path, args.socket_mode)?;
        server.run(listener, cancel).await?;
    }
    #[cfg(windows)]
    {
        let _ = args.socket_mode;
        let pipe_name = socket_path.to_string_lossy().into_owned();
        let listener = lodestar_protocol::transport::NamedPipeListener::bind(pipe_name)
            .context("creating named pipe")?;
        server.run(listener, cancel).await?;
    }

    info!("lodestar daemon stopped");
    Ok(())
}
