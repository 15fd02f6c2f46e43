//! Waiting for a TCP port to reach a desired state
//!
//! Used at startup to hold the proxy back until the origin accepts
//! connections. The check is a plain TCP connect on a fixed cadence; for the
//! local host a test bind settles the cases a connect cannot.

use crate::origin::OriginTarget;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, Instrument, Span};

/// Interval between two port checks
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound for a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Host dialed when the waiter is given an empty host
const LOCAL_HOST: &str = "localhost";

/// State a port is expected to reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Something accepts connections on the port
    InUse,
    /// Nothing is bound to the port
    Free,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::InUse => write!(f, "inuse"),
            PortState::Free => write!(f, "free"),
        }
    }
}

/// Progress of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCheckState {
    Checking,
    Satisfied,
    TimedOut,
    InvalidInput,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("port {0} out of range: port must be in 1..=65535")]
    InvalidPort(u32),
    #[error("cannot resolve host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("timeout of {}s reached before the port went into state '{state}'", .timeout.as_secs_f64())]
    Timeout { state: PortState, timeout: Duration },
}

impl WaitError {
    /// Terminal check state this error corresponds to
    pub fn check_state(&self) -> PortCheckState {
        match self {
            WaitError::InvalidPort(_) | WaitError::Resolve { .. } => PortCheckState::InvalidInput,
            WaitError::Timeout { .. } => PortCheckState::TimedOut,
        }
    }
}

/// Blocks until a port reaches the desired [`PortState`] or the timeout elapses
#[derive(Debug, Clone)]
pub struct WaitForPort {
    host: String,
    port: u32,
    state: PortState,
    timeout: Duration,
    span: Span,
}

impl WaitForPort {
    /// An empty `host` checks the local machine.
    pub fn new(host: impl Into<String>, port: u32, state: PortState, timeout: Duration) -> Self {
        let host = host.into();
        let span = tracing::info_span!("wait_for_port", host = %host, port, %state);
        Self {
            host,
            port,
            state,
            timeout,
            span,
        }
    }

    pub fn from_origin(origin: &OriginTarget, state: PortState, timeout: Duration) -> Self {
        Self::new(origin.host(), u32::from(origin.port()), state, timeout)
    }

    /// Run the waiter's logging inside the given span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn wait(&self) -> Result<(), WaitError> {
        self.run().instrument(self.span.clone()).await
    }

    async fn run(&self) -> Result<(), WaitError> {
        let port = validate_port(self.port)?;
        let deadline = Instant::now() + self.timeout;

        info!(timeout_secs = self.timeout.as_secs(), "Waiting for port");

        let result = tokio::time::timeout_at(deadline, async {
            self.resolve_host(port).await?;

            let mut attempts = 0u32;
            loop {
                attempts += 1;
                debug!(attempts, state = ?PortCheckState::Checking, "Checking port");
                if self.check(port).await {
                    info!(attempts, "Port reached desired state");
                    return Ok::<(), WaitError>(());
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => Err(WaitError::Timeout {
                state: self.state,
                timeout: self.timeout,
            }),
        }
    }

    /// An unresolvable host will not become resolvable by waiting, so this
    /// failure is returned right away.
    async fn resolve_host(&self, port: u16) -> Result<(), WaitError> {
        if self.host.is_empty() {
            return Ok(());
        }

        let resolve_err = |source| WaitError::Resolve {
            host: self.host.clone(),
            source,
        };

        let mut addrs = tokio::net::lookup_host((self.host.as_str(), port))
            .await
            .map_err(resolve_err)?;

        if addrs.next().is_none() {
            return Err(resolve_err(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses found",
            )));
        }

        Ok(())
    }

    async fn check(&self, port: u16) -> bool {
        match self.state {
            PortState::InUse => port_in_use(&self.host, port).await,
            PortState::Free if self.host.is_empty() => local_port_is_free(port).await,
            PortState::Free => remote_port_is_free(&self.host, port).await,
        }
    }
}

fn validate_port(port: u32) -> Result<u16, WaitError> {
    match u16::try_from(port) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(WaitError::InvalidPort(port)),
    }
}

async fn can_connect(host: &str, port: u16) -> bool {
    let host = if host.is_empty() { LOCAL_HOST } else { host };
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Outcome of trying to bind the port locally
#[derive(Debug)]
enum BindAttempt {
    Bound,
    AddrInUse,
    Failed(io::Error),
}

fn try_bind(port: u16) -> BindAttempt {
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            BindAttempt::Bound
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => BindAttempt::AddrInUse,
        Err(e) => BindAttempt::Failed(e),
    }
}

async fn port_in_use(host: &str, port: u16) -> bool {
    if can_connect(host, port).await {
        return true;
    }

    // Nothing more can be learned about a remote host
    if !host.is_empty() {
        return false;
    }

    matches!(try_bind(port), BindAttempt::AddrInUse)
}

/// Local check: a refused connect is only tentative, the test bind decides
async fn local_port_is_free(port: u16) -> bool {
    if can_connect("", port).await {
        return false;
    }

    match try_bind(port) {
        BindAttempt::Bound => true,
        BindAttempt::AddrInUse => false,
        BindAttempt::Failed(e) => {
            // e.g. privileged ports; nothing proves the port is taken
            debug!(port, error = %e, "Test bind failed, assuming port is free");
            true
        }
    }
}

/// Remote check: a failed connect is all the evidence available
async fn remote_port_is_free(host: &str, port: u16) -> bool {
    !can_connect(host, port).await
}
