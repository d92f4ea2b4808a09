//! Signal handling for graceful host shutdown.
//!
//! The first SIGINT/SIGTERM (Ctrl+C on Windows) cancels the host's shutdown
//! token so the main loop can stop at its next safe point and unload every
//! plugin. A second signal exits immediately.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Waits for a termination signal, then cancels `shutdown`.
///
/// # Platform Support
///
/// * **Unix platforms**: Handles SIGINT and SIGTERM signals
/// * **Windows**: Handles Ctrl+C signal
pub async fn setup_signal_handlers(shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    setup_signal_handlers_silent().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    shutdown.cancel();
    Ok(())
}

/// Waits for a termination signal without logging or cancelling anything.
pub async fn setup_signal_handlers_silent() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}
