use crate::signal::{cancelled, ShutdownSignal};
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, info, warn, Instrument, Span};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command string given")]
    Empty,
    #[error("can not parse server command '{command}': {source}")]
    Parse {
        command: String,
        #[source]
        source: shell_words::ParseError,
    },
    #[error("can not start server command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal server command (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// How the supervised command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandExit {
    /// Exited with status 0
    Success,
    /// Exited with a non-zero status
    Code(i32),
    /// Terminated by a signal
    Signaled(i32),
    /// Could not be waited on
    Failed(String),
}

impl CommandExit {
    fn from_wait(result: io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self::from_status(status),
            Err(e) => CommandExit::Failed(e.to_string()),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return CommandExit::Success;
        }
        if let Some(code) = status.code() {
            return CommandExit::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return CommandExit::Signaled(signal);
            }
        }
        CommandExit::Failed(status.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandExit::Success)
    }

    /// Whether the command was ended by a signal (the expected outcome of a relay)
    pub fn is_signaled(&self) -> bool {
        matches!(self, CommandExit::Signaled(_))
    }

    /// Process exit code for the supervisor: the command's own code, or 1 for
    /// anything that is not a plain exit
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandExit::Success => 0,
            CommandExit::Code(code) => *code,
            CommandExit::Signaled(_) | CommandExit::Failed(_) => 1,
        }
    }
}

impl fmt::Display for CommandExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandExit::Success => write!(f, "exited successfully"),
            CommandExit::Code(code) => write!(f, "exited with exit code {}", code),
            CommandExit::Signaled(signal) => write!(f, "terminated by signal {}", signal),
            CommandExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Signal relay handled by the wait task, which answers once it has acted
struct SignalRequest {
    signal: ShutdownSignal,
    reply: oneshot::Sender<Result<(), CommandError>>,
}

/// A supervised server command.
///
/// The child process is owned by a background task that waits for it and
/// publishes its [`CommandExit`] exactly once. Setting the shutdown channel to
/// `true` kills the process. Signals go through the same task, so a pid is
/// never signalled after the process has been reaped.
pub struct ServerCommand {
    program: String,
    pid: Option<u32>,
    /// Set by the wait task once the process has been reaped
    exited: Arc<AtomicBool>,
    exit_rx: Option<oneshot::Receiver<CommandExit>>,
    exit: Option<CommandExit>,
    signal_tx: mpsc::Sender<SignalRequest>,
    /// Forced kill request for the wait task
    kill: Arc<Notify>,
    span: Span,
}

impl ServerCommand {
    /// Start `command` with stdout and stderr attached to ours.
    ///
    /// The command is split into words like a POSIX shell would, but no shell
    /// is involved.
    pub fn start(command: &str, shutdown_rx: watch::Receiver<bool>) -> Result<Self, CommandError> {
        Self::start_with_span(command, shutdown_rx, tracing::info_span!("server_command"))
    }

    pub fn start_with_span(
        command: &str,
        shutdown_rx: watch::Receiver<bool>,
        span: Span,
    ) -> Result<Self, CommandError> {
        let args = parse_command(command)?;
        let (program, args) = args.split_first().ok_or(CommandError::Empty)?;

        let _entered = span.enter();
        info!(program = %program, args = ?args, "Starting subprocess as server command");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, "Server command spawned");

        let exited = Arc::new(AtomicBool::new(false));
        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = oneshot::channel();
        let (signal_tx, signal_rx) = mpsc::channel(4);

        tokio::spawn(
            wait_for_exit(
                child,
                shutdown_rx,
                signal_rx,
                Arc::clone(&kill),
                Arc::clone(&exited),
                exit_tx,
            )
            .instrument(span.clone()),
        );

        drop(_entered);
        Ok(Self {
            program: program.clone(),
            pid,
            exited,
            exit_rx: Some(exit_rx),
            exit: None,
            signal_tx,
            kill,
            span,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has been reaped
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Relay a termination signal to the process.
    ///
    /// Signalling a process that already finished is not an error.
    pub async fn signal(&self, signal: ShutdownSignal) -> Result<(), CommandError> {
        if self.has_exited() {
            debug!(parent: &self.span, signal = %signal, "Server command already finished, not relaying signal");
            return Ok(());
        }

        let (reply, reply_rx) = oneshot::channel();
        if self.signal_tx.send(SignalRequest { signal, reply }).await.is_err() {
            // Wait task is gone, so the process has been reaped
            return Ok(());
        }

        // A dropped reply means the process exited before the request was read
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Wait for the process to exit.
    ///
    /// Cancel safe; once the exit has been observed every later call returns
    /// the same outcome.
    pub async fn wait(&mut self) -> CommandExit {
        if let Some(exit_rx) = self.exit_rx.as_mut() {
            let exit = exit_rx
                .await
                .unwrap_or_else(|_| CommandExit::Failed("exit status was lost".to_string()));
            self.exit_rx = None;
            self.exit = Some(exit);
        }

        self.exit
            .clone()
            .unwrap_or_else(|| CommandExit::Failed("exit status was lost".to_string()))
    }

    /// Relay `signal` and wait for the process to exit.
    ///
    /// With a grace period the process is killed once it elapses; without one
    /// the wait is unbounded.
    pub async fn stop(&mut self, signal: ShutdownSignal, grace_period: Option<Duration>) -> CommandExit {
        if let Err(e) = self.signal(signal).await {
            // The wait below would never end without a kill
            error!(parent: &self.span, error = %e, "Failed to shutdown server command, killing it");
            self.kill.notify_one();
        }

        info!(parent: &self.span, "Waiting for server command to exit");

        let Some(grace_period) = grace_period else {
            return self.wait().await;
        };

        match tokio::time::timeout(grace_period, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    parent: &self.span,
                    grace_period_secs = grace_period.as_secs_f64(),
                    "Grace period exceeded, sending SIGKILL"
                );
                self.kill.notify_one();
                self.wait().await
            }
        }
    }
}

fn parse_command(command: &str) -> Result<Vec<String>, CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::Empty);
    }

    shell_words::split(command).map_err(|source| CommandError::Parse {
        command: command.to_string(),
        source,
    })
}

async fn wait_for_exit(
    mut child: Child,
    mut shutdown_rx: watch::Receiver<bool>,
    mut signal_rx: mpsc::Receiver<SignalRequest>,
    kill: Arc<Notify>,
    exited: Arc<AtomicBool>,
    exit_tx: oneshot::Sender<CommandExit>,
) {
    let exit = loop {
        tokio::select! {
            status = child.wait() => break CommandExit::from_wait(status),
            _ = cancelled(&mut shutdown_rx) => {
                info!("Cancelled, killing server command");
                break kill_and_wait(&mut child).await;
            }
            _ = kill.notified() => break kill_and_wait(&mut child).await,
            Some(request) = signal_rx.recv() => {
                let result = send_signal(&mut child, request.signal);
                let _ = request.reply.send(result);
            }
        }
    };

    exited.store(true, Ordering::SeqCst);
    info!(exit = %exit, "Server command finished");

    // Nobody listening is fine, the outcome is simply dropped
    let _ = exit_tx.send(exit);
}

/// Only called from the wait task while `child` has not been reaped
fn send_signal(child: &mut Child, signal: ShutdownSignal) -> Result<(), CommandError> {
    let Some(pid) = child.id() else {
        debug!(signal = %signal, "Server command already finished, not relaying signal");
        return Ok(());
    };

    info!(pid, signal = %signal, "Relaying signal to server command");

    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!(pid, "Server command already finished");
                return Ok(());
            }
            return Err(CommandError::Signal { pid, source: err });
        }
    }

    #[cfg(not(unix))]
    {
        child
            .start_kill()
            .map_err(|source| CommandError::Signal { pid, source })?;
    }

    Ok(())
}

async fn kill_and_wait(child: &mut Child) -> CommandExit {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to kill server command");
    }
    CommandExit::from_wait(child.wait().await)
}
