//! Listeners.
//!
//! [`Listener`] is the accept surface the serving engine consumes.
//! [`GracefulListener`] wraps any listener so that another task can close it
//! mid-`accept`; the pending or next `accept` then fails with [`ListenerClosed`],
//! which callers treat as the normal end of the accept loop.

use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Accept surface of a listening socket.
pub trait Listener: Send + Sync + 'static {
    /// Stream produced for each accepted connection.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// Address type of the listening socket and its peers.
    type Addr: fmt::Debug + Send + Sync + 'static;

    /// Wait for the next connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send;

    /// Address the listener is bound to.
    fn local_addr(&self) -> io::Result<Self::Addr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;
    type Addr = std::net::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        TcpListener::local_addr(self)
    }
}

impl Listener for UnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        UnixListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        UnixListener::local_addr(self)
    }
}

/// Error returned by [`GracefulListener::accept`] once the listener was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("listener closed")]
pub struct ListenerClosed;

impl From<ListenerClosed> for io::Error {
    fn from(closed: ListenerClosed) -> Self {
        io::Error::new(io::ErrorKind::Other, closed)
    }
}

/// Whether `err` reports a requested listener closure rather than a real failure.
pub fn is_listener_closed(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<ListenerClosed>())
}

/// Closes a [`GracefulListener`] from any task.
#[derive(Debug, Clone, Default)]
pub struct ListenerHandle {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Close the listener.
    ///
    /// Returns `true` for the call that actually closed it; later calls are no-ops.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.token.cancel();
            debug!("Listener closed");
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Listener whose `accept` can be interrupted by [`ListenerHandle::close`].
///
/// The socket itself is released when the accept loop drops the listener.
pub struct GracefulListener<L> {
    inner: L,
    handle: ListenerHandle,
}

impl<L: Listener> GracefulListener<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            handle: ListenerHandle::default(),
        }
    }

    /// Handle that closes this listener.
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Close the listener. See [`ListenerHandle::close`].
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: Listener + AsFd> GracefulListener<L> {
    /// Duplicate the listening socket, e.g. to hand it to another process.
    ///
    /// Connections already accepted are unaffected.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.inner.as_fd().try_clone_to_owned()
    }
}

impl<L: Listener> Listener for GracefulListener<L> {
    type Io = L::Io;
    type Addr = L::Addr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        async move {
            if self.handle.is_closed() {
                return Err(ListenerClosed.into());
            }
            tokio::select! {
                biased;
                _ = self.handle.token.cancelled() => Err(ListenerClosed.into()),
                accepted = self.inner.accept() => accepted,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

impl<L: AsFd> AsFd for GracefulListener<L> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Period between TCP keep-alive probes on accepted connections.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// TCP listener that enables keep-alive probes on every accepted connection,
/// so dead peers eventually drop out of the connection table.
pub struct TcpKeepAliveListener {
    inner: TcpListener,
    keepalive: TcpKeepalive,
}

impl TcpKeepAliveListener {
    pub fn new(inner: TcpListener) -> Self {
        Self {
            inner,
            keepalive: TcpKeepalive::new().with_time(KEEPALIVE_PERIOD),
        }
    }

    /// Bind a fresh listener on `addr`.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }
}

impl Listener for TcpKeepAliveListener {
    type Io = TcpStream;
    type Addr = std::net::SocketAddr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        async move {
            let (stream, addr) = self.inner.accept().await?;
            if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&self.keepalive) {
                warn!(error = %e, peer = %addr, "Failed to enable TCP keep-alive");
            }
            Ok::<_, io::Error>((stream, addr))
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

impl AsFd for TcpKeepAliveListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Operator-supplied listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    /// `host:port`, normalised so that an empty host binds all interfaces.
    Tcp(String),
    /// Filesystem path of a local (unix domain) socket.
    Unix(PathBuf),
}

impl BindAddr {
    pub fn is_unix(&self) -> bool {
        matches!(self, BindAddr::Unix(_))
    }
}

impl FromStr for BindAddr {
    type Err = Error;

    /// Parse an address.
    ///
    /// - `/path/to/socket` -> unix socket
    /// - `host:port`, `:port` -> TCP (`:port` binds all interfaces)
    /// - `:http` / `:https` -> ports 80 / 443
    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(BindAddr::Unix(PathBuf::from(s)));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_address(s, "missing port"))?;

        let port: u16 = match port {
            "http" => 80,
            "https" => 443,
            "" => return Err(Error::invalid_address(s, "missing port")),
            p => p
                .parse()
                .map_err(|_| Error::invalid_address(s, format!("invalid port {:?}", p)))?,
        };

        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(Error::invalid_address(s, "IPv6 hosts must be bracketed"));
        }
        let host = if host.is_empty() { "0.0.0.0" } else { host };

        Ok(BindAddr::Tcp(format!("{}:{}", host, port)))
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddr::Tcp(addr) => write!(f, "{}", addr),
            BindAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}
