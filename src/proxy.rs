use crate::error::{json_error_response, ProxyErrorCode};
use crate::idle::IdleTimer;
use crate::origin::OriginTarget;
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::signal::cancelled;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn, Instrument, Span};

/// Upper bound for draining open connections once shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after an accept failed for lack of file descriptors or memory
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle of the proxy listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

/// What moved the proxy out of `Serving`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout,
    Cancelled,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::IdleTimeout => write!(f, "idle timeout"),
            ShutdownReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("error during handling proxy request: {0}")]
    Serve(#[source] Arc<io::Error>),
    #[error("error while shutting down proxy server: connections still open after {0:?}")]
    DrainTimeout(Duration),
    #[error("proxy task ended without reporting a result")]
    Lost,
}

/// Resets the inactivity timer for every request, then forwards it
#[derive(Clone)]
pub struct IdleAwareForwarder {
    timer: Arc<IdleTimer>,
    pool: Arc<ConnectionPool>,
}

impl IdleAwareForwarder {
    pub fn new(timer: Arc<IdleTimer>, pool: Arc<ConnectionPool>) -> Self {
        Self { timer, pool }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.timer.reset();
        debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, "Forwarding request");

        match self.pool.send_request(req, client_addr).await {
            Ok(response) => response,
            Err(PoolError::RequestBuild(e)) => {
                warn!(client = %client_addr, error = %e, "Failed to rewrite request for origin");
                json_error_response(ProxyErrorCode::BadRequest, "Request could not be forwarded")
            }
            Err(e) => {
                // Log detailed error internally, return generic message externally
                error!(origin = %self.pool.origin(), error = %e, "Failed to forward request to origin");
                json_error_response(
                    ProxyErrorCode::UpstreamUnavailable,
                    "Failed to connect to origin",
                )
            }
        }
    }
}

/// Reverse proxy that shuts itself down after a period without requests
pub struct ProxyServer {
    origin: OriginTarget,
    listen_addr: String,
    idle_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
    pool_config: PoolConfig,
    span: Span,
}

impl ProxyServer {
    pub fn new(
        origin: OriginTarget,
        listen_addr: impl Into<String>,
        idle_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            origin,
            listen_addr: listen_addr.into(),
            idle_timeout,
            shutdown_rx,
            pool_config: PoolConfig::default(),
            span: tracing::info_span!("proxy"),
        }
    }

    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bind the listener and start serving.
    ///
    /// Never fails directly: a bind error is delivered through
    /// [`ProxyHandle::done`] like every other proxy error.
    pub async fn start(self) -> ProxyHandle {
        let (state_tx, state_rx) = watch::channel(ProxyState::Starting);
        let (done_tx, done_rx) = oneshot::channel();
        let shutdown_reason = Arc::new(OnceLock::new());

        let mut handle = ProxyHandle {
            local_addr: None,
            state_rx,
            done_rx: Some(done_rx),
            result: None,
            shutdown_reason: Arc::clone(&shutdown_reason),
        };

        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = ProxyError::Bind {
                    addr: self.listen_addr.clone(),
                    source: Arc::new(source),
                };
                error!(parent: &self.span, error = %err, "Failed to start proxy server");
                state_tx.send_replace(ProxyState::Stopped);
                let _ = done_tx.send(Err(err));
                return handle;
            }
        };

        let local_addr = listener.local_addr().ok();
        handle.local_addr = local_addr;

        info!(
            parent: &self.span,
            addr = ?local_addr,
            origin = %self.origin,
            idle_secs = self.idle_timeout.as_secs_f64(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );
        state_tx.send_replace(ProxyState::Serving);

        let timer = Arc::new(IdleTimer::new(self.idle_timeout));
        let pool = Arc::new(ConnectionPool::new(self.origin, self.pool_config));
        let forwarder = IdleAwareForwarder::new(Arc::clone(&timer), pool);
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(
            shutdown_trigger(timer, self.shutdown_rx, stop_tx).instrument(self.span.clone()),
        );
        tokio::spawn(
            serve(listener, forwarder, stop_rx, state_tx, done_tx, shutdown_reason)
                .instrument(self.span),
        );

        handle
    }
}

/// Race the inactivity timer against cancellation; the first one to fire
/// stops the serve loop
async fn shutdown_trigger(
    timer: Arc<IdleTimer>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut stop_tx: oneshot::Sender<ShutdownReason>,
) {
    let reason = tokio::select! {
        _ = timer.expired() => {
            info!(idle_secs = timer.idle_duration().as_secs_f64(), "Idle time passed, shutting down proxy");
            ShutdownReason::IdleTimeout
        }
        _ = cancelled(&mut shutdown_rx) => {
            info!("Cancelled, shutting down proxy");
            ShutdownReason::Cancelled
        }
        // Serve loop already ended on its own
        _ = stop_tx.closed() => return,
    };

    let _ = stop_tx.send(reason);
}

async fn serve(
    listener: TcpListener,
    forwarder: IdleAwareForwarder,
    mut stop_rx: oneshot::Receiver<ShutdownReason>,
    state_tx: watch::Sender<ProxyState>,
    done_tx: oneshot::Sender<Result<(), ProxyError>>,
    shutdown_reason: Arc<OnceLock<ShutdownReason>>,
) {
    let graceful = GracefulShutdown::new();
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250);

    let stats = forwarder.pool.stats();
    let mut result = Ok(());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let forwarder = forwarder.clone();
                        let service = service_fn(move |req: Request<Incoming>| {
                            let forwarder = forwarder.clone();
                            async move { Ok::<_, Infallible>(forwarder.handle(req, addr).await) }
                        });

                        let conn = builder
                            .serve_connection_with_upgrades(TokioIo::new(stream), service)
                            .into_owned();
                        let conn = graceful.watch(conn);

                        tokio::spawn(
                            async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) if is_resource_exhausted(&e) => {
                        warn!(error = %e, "Out of resources accepting connection, backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!(error = %e, "Failed to accept connection");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection, stopping proxy");
                        result = Err(ProxyError::Serve(Arc::new(e)));
                        break;
                    }
                }
            }
            reason = &mut stop_rx => {
                if let Ok(reason) = reason {
                    let _ = shutdown_reason.set(reason);
                }
                break;
            }
        }
    }

    state_tx.send_replace(ProxyState::ShuttingDown);
    drop(listener);
    drop(stop_rx);

    if tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown())
        .await
        .is_err()
    {
        let err = ProxyError::DrainTimeout(DRAIN_TIMEOUT);
        warn!(error = %err, "Forcing proxy shutdown");
        if result.is_ok() {
            result = Err(err);
        }
    }

    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Proxy server stopped"
    );
    state_tx.send_replace(ProxyState::Stopped);

    // Nobody listening is fine, the result is simply dropped
    let _ = done_tx.send(result);
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(unix)]
fn is_resource_exhausted(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(_e: &io::Error) -> bool {
    false
}

/// Handle to a running proxy
pub struct ProxyHandle {
    local_addr: Option<SocketAddr>,
    state_rx: watch::Receiver<ProxyState>,
    done_rx: Option<oneshot::Receiver<Result<(), ProxyError>>>,
    result: Option<Result<(), ProxyError>>,
    shutdown_reason: Arc<OnceLock<ShutdownReason>>,
}

impl ProxyHandle {
    /// Bound listener address, `None` if binding failed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> watch::Receiver<ProxyState> {
        self.state_rx.clone()
    }

    /// Which trigger stopped the proxy, once one has fired
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown_reason.get().copied()
    }

    /// Wait for the proxy to stop.
    ///
    /// Cancel safe; the result is delivered once by the proxy and every later
    /// call returns the same value.
    pub async fn done(&mut self) -> Result<(), ProxyError> {
        if let Some(done_rx) = self.done_rx.as_mut() {
            let result = done_rx.await.unwrap_or(Err(ProxyError::Lost));
            self.done_rx = None;
            self.result = Some(result);
        }

        self.result.clone().unwrap_or(Err(ProxyError::Lost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn origin() -> OriginTarget {
        // Nothing listens on the discard port in test environments
        OriginTarget::parse("http://127.0.0.1:9").unwrap()
    }

    fn start_server(idle: Duration, shutdown_rx: watch::Receiver<bool>) -> ProxyServer {
        ProxyServer::new(origin(), "127.0.0.1:0", idle, shutdown_rx)
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[test]
    fn test_resource_exhaustion_is_detected() {
        assert!(is_resource_exhausted(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_resource_exhausted(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_error_messages() {
        let err = ProxyError::Bind {
            addr: "0.0.0.0:80".to_string(),
            source: Arc::new(io::Error::from(io::ErrorKind::AddrInUse)),
        };
        assert!(err.to_string().starts_with("failed to bind proxy listener on 0.0.0.0:80"));
        assert!(ProxyError::DrainTimeout(DRAIN_TIMEOUT)
            .to_string()
            .starts_with("error while shutting down proxy server"));
    }

    #[tokio::test]
    async fn test_idle_timeout_stops_proxy() {
        let (_tx, rx) = watch::channel(false);
        let mut handle = start_server(Duration::from_millis(300), rx).start().await;

        assert!(handle.local_addr().is_some());
        assert_eq!(*handle.state().borrow(), ProxyState::Serving);

        let result = tokio::time::timeout(Duration::from_secs(3), handle.done())
            .await
            .expect("proxy should stop on its own");

        assert!(result.is_ok());
        assert_eq!(handle.shutdown_reason(), Some(ShutdownReason::IdleTimeout));
        assert_eq!(*handle.state().borrow(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn test_cancellation_stops_proxy_once() {
        let (tx, rx) = watch::channel(false);
        let mut handle = start_server(Duration::from_secs(60), rx).start().await;

        tx.send(true).unwrap();
        let _ = tx.send(true);

        let result = tokio::time::timeout(Duration::from_secs(3), handle.done())
            .await
            .expect("proxy should stop after cancellation");
        assert!(result.is_ok());
        assert_eq!(handle.shutdown_reason(), Some(ShutdownReason::Cancelled));

        // A further cancellation and a second wait change nothing
        let _ = tx.send(true);
        assert!(handle.done().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_cancellation_scope_does_not_stop_proxy() {
        let (tx, rx) = watch::channel(false);
        let mut handle = start_server(Duration::from_millis(500), rx).start().await;
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(3), handle.done())
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(handle.shutdown_reason(), Some(ShutdownReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);

        let mut handle = ProxyServer::new(origin(), addr.to_string(), Duration::from_secs(60), rx)
            .start()
            .await;

        assert!(handle.local_addr().is_none());
        assert!(matches!(handle.done().await, Err(ProxyError::Bind { .. })));
        assert_eq!(*handle.state().borrow(), ProxyState::Stopped);
    }

    /// Origin that accepts connections and never answers
    async fn start_silent_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_drain_timeout_is_reported_and_proxy_still_stops() {
        let origin_addr = start_silent_origin().await;
        let origin = OriginTarget::parse(&format!("http://{}", origin_addr)).unwrap();
        let (tx, rx) = watch::channel(false);
        let mut handle = ProxyServer::new(origin, "127.0.0.1:0", Duration::from_secs(60), rx)
            .start()
            .await;
        let addr = handle.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response).await;
        });

        // Let the request reach the origin before cancelling
        tokio::time::sleep(Duration::from_millis(300)).await;
        let start = std::time::Instant::now();
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), handle.done())
            .await
            .expect("proxy should stop once the drain bound passes");

        assert!(matches!(result, Err(ProxyError::DrainTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(900));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(*handle.state().borrow(), ProxyState::Stopped);
        assert_eq!(handle.shutdown_reason(), Some(ShutdownReason::Cancelled));

        client.abort();
    }

    #[tokio::test]
    async fn test_unreachable_origin_returns_bad_gateway() {
        let (tx, rx) = watch::channel(false);
        let mut handle = start_server(Duration::from_secs(60), rx).start().await;
        let addr = handle.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 502"));
        assert!(response.contains("UPSTREAM_UNAVAILABLE"));

        tx.send(true).unwrap();
        assert!(handle.done().await.is_ok());
    }
}
