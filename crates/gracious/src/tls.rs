//! TLS listener.
//!
//! [`TlsListener`] wraps any [`Listener`] and hands out [`TlsConn`]s. The
//! handshake runs lazily on the connection's own task (first read or write),
//! so a slow client never stalls the accept loop, and closing the inner
//! listener behaves exactly as it does without TLS.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};
use tracing::info;

use crate::error::{Error, Result};
use crate::listener::Listener;

/// Load a server configuration from PEM certificate chain and private key files.
///
/// ALPN defaults to `http/1.1`.
pub fn load_tls_config(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Arc<ServerConfig>> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file = File::open(cert_path).map_err(|e| {
        Error::tls(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        Error::tls(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::tls(format!("Invalid certificate in {}: {}", cert_path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("No certificate found in {}", cert_path.display())));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::tls(format!("Invalid private key in {}: {}", key_path.display(), e)))?
        .ok_or_else(|| Error::tls(format!("No private key found in {}", key_path.display())))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls(format!("TLS config error: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| Error::tls(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!(cert = %cert_path.display(), "Loaded TLS certificate");

    Ok(Arc::new(config))
}

/// Listener that terminates TLS on top of another listener.
pub struct TlsListener<L> {
    inner: L,
    acceptor: TlsAcceptor,
}

impl<L: Listener> TlsListener<L> {
    /// Wrap `inner`. An empty ALPN list is filled with `http/1.1`.
    pub fn new(inner: L, config: Arc<ServerConfig>) -> Self {
        let config = if config.alpn_protocols.is_empty() {
            let mut config = (*config).clone();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        } else {
            config
        };
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }
}

impl<L: Listener> Listener for TlsListener<L> {
    type Io = TlsConn<L::Io>;
    type Addr = L::Addr;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, Self::Addr)>> + Send {
        async move {
            let (io, addr) = self.inner.accept().await?;
            Ok::<_, io::Error>((TlsConn::new(self.acceptor.accept(io)), addr))
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

impl<L: AsFd> AsFd for TlsListener<L> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

enum TlsState<IO> {
    Handshaking(Accept<IO>),
    Streaming(Box<TlsStream<IO>>),
    Failed,
}

/// Server-side TLS stream that completes its handshake on first use.
pub struct TlsConn<IO> {
    state: TlsState<IO>,
}

impl<IO> TlsConn<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn new(accept: Accept<IO>) -> Self {
        Self {
            state: TlsState::Handshaking(accept),
        }
    }

    /// Whether the handshake has completed successfully.
    pub fn is_established(&self) -> bool {
        matches!(self.state, TlsState::Streaming(_))
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let TlsState::Handshaking(accept) = &mut self.state {
            match ready!(Pin::new(accept).poll(cx)) {
                Ok(stream) => self.state = TlsState::Streaming(Box::new(stream)),
                Err(e) => {
                    self.state = TlsState::Failed;
                    return Poll::Ready(Err(e));
                }
            }
        }
        match self.state {
            TlsState::Failed => Poll::Ready(Err(handshake_failed())),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn stream(&mut self) -> io::Result<Pin<&mut TlsStream<IO>>> {
        match &mut self.state {
            TlsState::Streaming(stream) => Ok(Pin::new(stream.as_mut())),
            _ => Err(handshake_failed()),
        }
    }
}

fn handshake_failed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake did not complete")
}

impl<IO> AsyncRead for TlsConn<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.stream()?.poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for TlsConn<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.stream()?.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            TlsState::Streaming(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            TlsState::Streaming(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}
