//! OS termination signals as an explicit event source
//!
//! The supervisor never installs handlers itself; it is handed a receiver of
//! [`ShutdownSignal`]s. The binary feeds it from the OS via [`listen`], tests
//! feed it by hand.

use std::fmt;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// A request from outside the process to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl ShutdownSignal {
    /// Raw signal number to relay to a child process
    #[cfg(unix)]
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            ShutdownSignal::Interrupt => libc::SIGINT,
            ShutdownSignal::Terminate => libc::SIGTERM,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Subscribe to SIGINT and SIGTERM.
///
/// Signals are delivered on the returned channel until the receiver is
/// dropped.
pub fn listen() -> std::io::Result<mpsc::Receiver<ShutdownSignal>> {
    let (tx, rx) = mpsc::channel(2);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = sigint.recv() => ShutdownSignal::Interrupt,
                    Some(()) = sigterm.recv() => ShutdownSignal::Terminate,
                    else => break,
                };
                info!(signal = %received, "Received signal");
                if tx.send(received).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    break;
                }
                info!(signal = %ShutdownSignal::Interrupt, "Received signal");
                if tx.send(ShutdownSignal::Interrupt).await.is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

/// Resolve once the cancellation scope is set; idempotent for repeated sends
pub async fn cancelled(shutdown_rx: &mut watch::Receiver<bool>) {
    // A dropped sender can no longer cancel anything
    if shutdown_rx.wait_for(|shutdown| *shutdown).await.is_err() {
        std::future::pending::<()>().await;
    }
}
