//! beekeeper-stub entry point.

use beekeeper_stub::{spawn, StubConfig, StubError, Toggle};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code when the webserver endpoint cannot be bound.
const EXIT_OPENING_FAILED: i32 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = StubConfig::parse();

    // Logs go to stderr, which the harness captures.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("beekeeper_stub=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        wallet_dir = %config.wallet_dir.display(),
        unlock_timeout = config.unlock_timeout,
        backtrace = config.backtrace == Toggle::Yes,
        "Starting beekeeper-stub"
    );

    let server = match spawn(config).await {
        Ok(server) => server,
        Err(e @ StubError::Bind { .. }) => {
            tracing::error!(error = %e, "Opening beekeeper failed");
            std::process::exit(EXIT_OPENING_FAILED);
        }
        Err(e) => return Err(e.into()),
    };

    shutdown_signal().await?;
    tracing::info!("Received shutdown signal, closing sessions...");
    server.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}
