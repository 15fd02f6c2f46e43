//! Top-level orchestration: command, readiness wait, proxy and the shutdown race
//!
//! The supervisor owns the cancellation scope handed to both the server
//! command and the proxy. Whatever finishes first decides the exit code; the
//! rest is shut down in order and the proxy is always awaited before
//! [`Supervisor::run`] returns.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::origin::OriginTarget;
use crate::pool::PoolConfig;
use crate::process::{CommandExit, ServerCommand};
use crate::proxy::{ProxyError, ProxyHandle, ProxyServer};
use crate::signal::ShutdownSignal;
use crate::wait::{PortState, WaitForPort};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Instrument, Span};

/// What ended the serving phase
enum Event {
    ProxyStopped(Result<(), ProxyError>),
    CommandExited(CommandExit),
    Signal(ShutdownSignal),
}

pub struct Supervisor {
    config: Config,
    span: Span,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            span: tracing::info_span!("tired_proxy"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run until idle timeout, command exit or signal and return the exit code.
    ///
    /// Errors are only returned for startup failures; anything after the proxy
    /// started is logged and folded into the exit code.
    pub async fn run(self, signals: mpsc::Receiver<ShutdownSignal>) -> Result<i32, SupervisorError> {
        let span = self.span.clone();
        self.run_inner(signals).instrument(span).await
    }

    async fn run_inner(self, mut signals: mpsc::Receiver<ShutdownSignal>) -> Result<i32, SupervisorError> {
        let origin = OriginTarget::parse(&self.config.origin)?;
        info!(origin = %origin, "Setup proxy for origin");

        let grace_period = self.config.shutdown_grace_period();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut command = match self.config.command.as_deref() {
            Some(command) => Some(ServerCommand::start_with_span(
                command,
                shutdown_rx.clone(),
                tracing::info_span!(parent: &self.span, "server_command"),
            )?),
            None => None,
        };

        if let Some(timeout) = self.config.upstream_timeout() {
            info!(timeout_secs = timeout.as_secs(), "Waiting for upstream host to come online");
            let waiter = WaitForPort::from_origin(&origin, PortState::InUse, timeout).with_span(
                tracing::info_span!(parent: &self.span, "wait_for_port", port = origin.port()),
            );

            tokio::select! {
                result = waiter.wait() => match result {
                    Ok(()) => info!("Upstream host came online"),
                    Err(e) => {
                        let _ = shutdown_tx.send(true);
                        if let Some(command) = command.as_mut() {
                            command.wait().await;
                        }
                        return Err(e.into());
                    }
                },
                exit = command_exit(&mut command) => {
                    warn!(exit = %exit, "Server command ended before upstream host came online");
                    return Ok(exit.exit_code());
                }
                Some(signal) = signals.recv() => {
                    info!(signal = %signal, "Signal received while waiting for upstream host");
                    if let Some(command) = command.as_mut() {
                        log_stopped_command(&command.stop(signal, grace_period).await);
                    }
                    return Ok(0);
                }
            }
        }

        let mut proxy = ProxyServer::new(
            origin,
            self.config.listen_addr(),
            self.config.idle_timeout(),
            shutdown_rx,
        )
        .with_pool_config(PoolConfig {
            max_idle_per_host: self.config.pool_max_idle_per_host,
            idle_timeout: self.config.pool_idle_timeout(),
        })
        .with_span(tracing::info_span!(parent: &self.span, "proxy"))
        .start()
        .await;

        let event = tokio::select! {
            result = proxy.done() => Event::ProxyStopped(result),
            exit = command_exit(&mut command) => Event::CommandExited(exit),
            Some(signal) = signals.recv() => Event::Signal(signal),
        };

        let exit_code = match event {
            Event::ProxyStopped(result) => {
                let code = match result {
                    Ok(()) => {
                        info!("Idle time passed, shutting down server");
                        0
                    }
                    Err(e @ ProxyError::DrainTimeout(_)) => {
                        warn!(error = %e, "Idle time passed, shutting down server");
                        0
                    }
                    Err(e) => {
                        error!(error = %e, "Proxy server failed, shutting down server");
                        1
                    }
                };
                if let Some(command) = command.as_mut() {
                    log_stopped_command(&command.stop(ShutdownSignal::Terminate, grace_period).await);
                }
                let _ = shutdown_tx.send(true);
                code
            }
            Event::CommandExited(exit) => {
                log_command_exit(&exit);
                let _ = shutdown_tx.send(true);
                await_proxy(&mut proxy).await;
                exit.exit_code()
            }
            Event::Signal(signal) => {
                info!(signal = %signal, "Signal received, shutting down server");
                if let Some(command) = command.as_mut() {
                    log_stopped_command(&command.stop(signal, grace_period).await);
                }
                let _ = shutdown_tx.send(true);
                await_proxy(&mut proxy).await;
                0
            }
        };

        info!(exit_code, "Shutdown tired-proxy");
        Ok(exit_code)
    }
}

/// Completion of the optional command; never resolves without one
async fn command_exit(command: &mut Option<ServerCommand>) -> CommandExit {
    match command {
        Some(command) => command.wait().await,
        None => std::future::pending().await,
    }
}

async fn await_proxy(proxy: &mut ProxyHandle) {
    if let Err(e) = proxy.done().await {
        error!(error = %e, "Proxy server reported an error during shutdown");
    }
}

fn log_command_exit(exit: &CommandExit) {
    match exit {
        CommandExit::Success => info!("Server command exited successfully"),
        CommandExit::Code(code) => info!(code, "Server command exited with exit code"),
        CommandExit::Signaled(_) | CommandExit::Failed(_) => {
            warn!(exit = %exit, "Server command exited with an error")
        }
    }
}

/// A relayed signal ending the command is the expected outcome
fn log_stopped_command(exit: &CommandExit) {
    match exit {
        CommandExit::Failed(_) => {
            error!(exit = %exit, "Error while waiting for server command to shut down")
        }
        _ => info!(exit = %exit, "Server command shut down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(origin: &str) -> Config {
        Config {
            origin: origin.to_string(),
            port: 0,
            bind: "127.0.0.1".to_string(),
            idle_timeout_secs: 1,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_malformed_origin_is_fatal() {
        let (_tx, rx) = mpsc::channel(1);
        let result = Supervisor::new(config("://bad")).run(rx).await;

        assert!(matches!(result, Err(SupervisorError::Origin(_))));
    }

    #[tokio::test]
    async fn test_unparsable_command_is_fatal() {
        let mut config = config("http://127.0.0.1:9");
        config.command = Some("echo 'unterminated".to_string());
        let (_tx, rx) = mpsc::channel(1);

        let result = Supervisor::new(config).run(rx).await;
        assert!(matches!(result, Err(SupervisorError::Command(_))));
    }

    #[tokio::test]
    async fn test_idle_shutdown_without_command() {
        let (_tx, rx) = mpsc::channel(1);

        let code = tokio::time::timeout(
            Duration::from_secs(5),
            Supervisor::new(config("http://127.0.0.1:9")).run(rx),
        )
        .await
        .expect("proxy should go idle")
        .unwrap();

        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_signal_exits_zero_without_command() {
        let (tx, rx) = mpsc::channel(1);
        let mut config = config("http://127.0.0.1:9");
        config.idle_timeout_secs = 60;

        let run = tokio::spawn(Supervisor::new(config).run(rx));
        tx.send(ShutdownSignal::Interrupt).await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_timeout_cancels_command() {
        let mut config = config("http://127.0.0.1:1");
        config.upstream_timeout_secs = 1;
        config.command = Some("sleep 100".to_string());
        let (_tx, rx) = mpsc::channel(1);

        let result = tokio::time::timeout(Duration::from_secs(5), Supervisor::new(config).run(rx))
            .await
            .expect("readiness wait should give up");

        assert!(matches!(result, Err(SupervisorError::Readiness(_))));
    }
}
