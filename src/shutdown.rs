//! Signal handling: SIGINT/SIGTERM stop the agent, SIGHUP requests a resync.

use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Installs the handlers and returns the shutdown token.
///
/// The first SIGINT or SIGTERM cancels the token; clones of it are handed to
/// every loop. Each SIGHUP wakes one waiter on `resync`, which the
/// reconciliation loop treats as an out-of-schedule trigger.
///
/// Must be called from within a Tokio runtime.
pub fn install_signal_handlers(resync: Arc<Notify>) -> std::io::Result<CancellationToken> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let token = CancellationToken::new();

    let shutdown = token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "shutdown requested");
        shutdown.cancel();
    });

    let stop = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received; resync requested");
                    resync.notify_one();
                }
            }
        }
    });

    Ok(token)
}
