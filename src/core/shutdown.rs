//! # OS termination signals.
//!
//! Provides [`wait_for_shutdown_signal`], an async helper that completes when the
//! process receives a termination signal. The binary awaits it and then calls
//! [`Router::shutdown`](crate::Router::shutdown) so no child process outlives it.
//!
//! ## Signals
//! - `SIGINT` (Ctrl-C in terminal)
//! - `SIGTERM` (default kill signal, sent by the session manager on logout)
//! - `SIGQUIT` (quit signal)
//! - `SIGHUP` (controlling terminal closed)

use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

/// Waits for a termination signal.
///
/// Each call creates independent signal listeners.
///
/// Returns `Ok(())` when any signal is received, or `Err` if signal registration fails.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let name = tokio::select! {
        _ = sigint.recv()  => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
        _ = sighup.recv()  => "SIGHUP",
    };
    info!(signal = name, "shutdown requested");
    Ok(())
}
