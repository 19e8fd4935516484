//! Proxy sockets and connection relaying.
//!
//! A proxy socket owns the listener of one service port. Its accept loop:
//! - Re-checks the proxier's entry for the service before every accept and
//!   exits when the entry is gone or belongs to a newer generation
//! - Hands each accepted connection to its own task, which picks an
//!   endpoint, dials it and relays bytes both ways
//! - Drains when the socket is closed
//!
//! Only TCP is implemented; other protocols plug in behind [`ProxySocket`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};

use super::balancer::{LoadBalancer, ServicePortName};
use super::error::{AcceptError, ProxyError};
use super::proxier::Proxier;

/// Size of each relay direction's buffer.
pub const RELAY_BUFFER_SIZE: usize = 32 << 10;

/// Default timeout for dialing a backend.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Transport protocols a proxy socket can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            _ => Err(ProxyError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Lifecycle of a proxy socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Listening and accepting.
    Running,
    /// Closed, accept loop not yet exited.
    Draining,
    /// Listener released.
    Closed,
}

impl SocketState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SocketState::Running,
            1 => SocketState::Draining,
            _ => SocketState::Closed,
        }
    }
}

/// Statistics for a proxy socket.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections dropped because no endpoint was available.
    pub endpoint_failed: AtomicU64,
    /// Connections dropped because the backend could not be dialed.
    pub dial_failed: AtomicU64,
    /// Transient accept errors.
    pub accept_errors: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// A protocol-specific listening socket for one service port.
#[async_trait]
pub trait ProxySocket: Send + Sync {
    /// Accept and relay connections until the socket is closed or the
    /// proxier no longer runs `generation` for `service`.
    async fn proxy_loop(
        self: Arc<Self>,
        service: ServicePortName,
        generation: u64,
        proxier: Weak<Proxier>,
    );

    /// Stop accepting. The accept loop observes this as a drain signal.
    fn close(&self) -> Result<(), ProxyError>;

    /// Address the socket listens on.
    fn local_addr(&self) -> SocketAddr;

    fn state(&self) -> SocketState;

    fn stats(&self) -> &ProxyStats;
}

/// Build a proxy socket for `protocol` listening on `addr`.
pub async fn new_proxy_socket(
    protocol: &str,
    addr: SocketAddr,
    dial_timeout: Duration,
) -> Result<Arc<dyn ProxySocket>, ProxyError> {
    match protocol.parse::<Protocol>()? {
        Protocol::Tcp => {
            let socket = TcpProxySocket::bind(addr, dial_timeout).await?;
            Ok(Arc::new(socket))
        }
    }
}

/// TCP proxy socket.
pub struct TcpProxySocket {
    /// Taken by the accept loop when it starts; dropped on exit.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    dial_timeout: Duration,
    closed: watch::Sender<bool>,
    state: AtomicU8,
    stats: ProxyStats,
}

impl TcpProxySocket {
    /// Bind and listen on `addr`.
    pub async fn bind(addr: SocketAddr, dial_timeout: Duration) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                port: addr.port(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ProxyError::Bind {
            port: addr.port(),
            source,
        })?;

        debug!(bind_addr = %local_addr, "Proxy socket bound");

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            dial_timeout,
            closed: watch::Sender::new(false),
            state: AtomicU8::new(SocketState::Running as u8),
            stats: ProxyStats::default(),
        })
    }

    fn take_listener(&self) -> Option<TcpListener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for the next connection or the close signal.
    async fn accept(
        &self,
        listener: &TcpListener,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<(TcpStream, SocketAddr), AcceptError> {
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(AcceptError::ListenerClosed),
            result = listener.accept() => result.map_err(AcceptError::Io),
        }
    }
}

#[async_trait]
impl ProxySocket for TcpProxySocket {
    async fn proxy_loop(
        self: Arc<Self>,
        service: ServicePortName,
        generation: u64,
        proxier: Weak<Proxier>,
    ) {
        let Some(listener) = self.take_listener() else {
            // Closed before the loop got to run.
            self.state
                .store(SocketState::Closed as u8, Ordering::SeqCst);
            return;
        };
        let mut closed = self.closed.subscribe();
        info!(service = %service, bind_addr = %self.local_addr, "Proxy loop started");

        loop {
            let balancer = {
                let Some(proxier) = proxier.upgrade() else {
                    break;
                };
                match proxier.get_service_info(&service).await {
                    Some(info) if info.generation == generation => {}
                    _ => {
                        debug!(service = %service, generation, "Proxy loop is stale");
                        break;
                    }
                }
                proxier.load_balancer()
            };

            let (client, peer_addr) = match self.accept(&listener, &mut closed).await {
                Ok(accepted) => accepted,
                Err(AcceptError::ListenerClosed) => break,
                Err(AcceptError::Io(e)) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(service = %service, error = %e, "Accept error");
                    // Persistent errors (EMFILE) would otherwise spin.
                    if backoff(&mut closed).await {
                        continue;
                    }
                    break;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let socket = Arc::clone(&self);
            let service = service.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = socket.handle_connection(client, &service, balancer).await {
                        warn!(
                            service = %service,
                            reason = e.reason_code(),
                            error = %e,
                            "Dropping connection"
                        );
                    }
                    socket
                        .stats
                        .connections_active
                        .fetch_sub(1, Ordering::Relaxed);
                    socket
                        .stats
                        .connections_closed
                        .fetch_add(1, Ordering::Relaxed);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }

        drop(listener);
        self.state
            .store(SocketState::Closed as u8, Ordering::SeqCst);
        info!(service = %service, bind_addr = %self.local_addr, "Proxy loop stopped");
    }

    fn close(&self) -> Result<(), ProxyError> {
        let previous = self.state.compare_exchange(
            SocketState::Running as u8,
            SocketState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if previous.is_err() {
            return Err(ProxyError::SocketClosed);
        }

        self.closed.send_replace(true);
        // If the loop never started, the listener is still parked here.
        if self.take_listener().is_some() {
            self.state
                .store(SocketState::Closed as u8, Ordering::SeqCst);
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn stats(&self) -> &ProxyStats {
        &self.stats
    }
}

impl TcpProxySocket {
    /// Pick an endpoint, dial it and relay until either side closes.
    ///
    /// Returning early drops `client`, which closes it without data.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        service: &ServicePortName,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Result<(), ProxyError> {
        let endpoint = match balancer.next_endpoint(service).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.stats.endpoint_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let mut backend = match connect(&endpoint, self.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        debug!(service = %service, endpoint = %endpoint, "Connected to backend");

        let finished = relay(&mut client, &mut backend, &self.stats).await;
        debug!(
            service = %service,
            endpoint = %endpoint,
            finished = %finished,
            "Connection closed"
        );
        Ok(())
    }
}

/// Sleep after an accept error. Returns false if the socket closed meanwhile.
async fn backoff(closed: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = closed.wait_for(|closed| *closed) => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// Dial a backend with a bounded timeout.
async fn connect(endpoint: &str, dial_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let result = match timeout(dial_timeout, TcpStream::connect(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    };
    result.map_err(|source| ProxyError::Dial {
        endpoint: endpoint.to_string(),
        source,
    })
}

/// Which relay direction finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    ToBackend,
    FromBackend,
}

impl fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayDirection::ToBackend => write!(f, "client"),
            RelayDirection::FromBackend => write!(f, "backend"),
        }
    }
}

/// Relay bytes both ways until one direction stops.
///
/// The first direction to hit EOF or an error ends the relay. The other
/// direction is dropped mid-flight, its error swallowed, and both streams
/// close when the caller drops them.
pub async fn relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    stats: &ProxyStats,
) -> RelayDirection {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    tokio::select! {
        _ = copy_content(&mut client_read, &mut backend_write, &stats.bytes_to_backend) => {
            RelayDirection::ToBackend
        }
        _ = copy_content(&mut backend_read, &mut client_write, &stats.bytes_from_backend) => {
            RelayDirection::FromBackend
        }
    }
}

/// Copy from `src` to `dst` until a read or write fails or `src` hits EOF.
async fn copy_content<R, W>(src: &mut R, dst: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
