//! Serving engines.
//!
//! An [`Engine`] runs the accept loop and the per-connection request
//! handling. The graceful server only needs three things from it: it must
//! accept from whatever [`Listener`] it is given, report every connection
//! transition to the supplied observer, and support switching keep-alives off.
//!
//! [`HttpEngine`] is the bundled HTTP/1.1 engine, built on hyper with an axum
//! [`Router`] as the request handler.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::Router;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::ServiceExt;
use tracing::{debug, info_span, warn, Instrument};

use crate::listener::Listener;
use crate::tracker::{Conn, ConnState};

/// Callback receiving every connection state transition.
pub type StateObserver = Arc<dyn Fn(&Conn, ConnState) + Send + Sync>;

/// Accept loop and request dispatcher the graceful server runs on top of.
pub trait Engine: Send + Sync + 'static {
    /// Accept connections from `listener` until it fails, reporting every
    /// connection transition to `observer`.
    ///
    /// Returns the accept error that ended the loop.
    fn serve<L: Listener>(
        &self,
        listener: L,
        observer: StateObserver,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Allow or forbid further requests on existing persistent connections.
    fn set_keep_alives_enabled(&self, enabled: bool);

    /// Observer the host installed on the engine itself, if any.
    ///
    /// The graceful server forwards every transition to it after its own tracking.
    fn conn_state_hook(&self) -> Option<StateObserver> {
        None
    }
}

/// HTTP/1.1 engine dispatching requests to an axum [`Router`].
///
/// Connection transitions:
/// - `New` when the connection is accepted
/// - `Active` when a request arrives
/// - `Idle` once its response has been written and flushed to the socket
/// - `Hijacked` when the handler answers `101 Switching Protocols`
/// - `Closed` when the connection ends
///
/// The [`Conn`] of the connection is available to handlers as a request extension.
#[derive(Clone)]
pub struct HttpEngine {
    router: Router,
    keep_alives: Arc<AtomicBool>,
    conn_state: Option<StateObserver>,
}

impl HttpEngine {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            keep_alives: Arc::new(AtomicBool::new(true)),
            conn_state: None,
        }
    }

    /// Install a host observer that is chained after graceful tracking.
    pub fn with_conn_state(mut self, hook: StateObserver) -> Self {
        self.conn_state = Some(hook);
        self
    }

    pub fn keep_alives_enabled(&self) -> bool {
        self.keep_alives.load(Ordering::SeqCst)
    }

    async fn accept_loop<L: Listener>(
        &self,
        listener: L,
        observer: StateObserver,
    ) -> io::Result<()> {
        loop {
            let (io, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let conn = Conn::new();
            observer(&conn, ConnState::New);

            let span = info_span!("http.connection", conn = %conn.id(), peer = ?peer);
            tokio::spawn(
                serve_connection(
                    io,
                    conn,
                    self.router.clone(),
                    Arc::clone(&self.keep_alives),
                    Arc::clone(&observer),
                )
                .instrument(span),
            );
        }
    }
}

impl Engine for HttpEngine {
    fn serve<L: Listener>(
        &self,
        listener: L,
        observer: StateObserver,
    ) -> impl Future<Output = io::Result<()>> + Send {
        self.accept_loop(listener, observer)
    }

    fn set_keep_alives_enabled(&self, enabled: bool) {
        self.keep_alives.store(enabled, Ordering::SeqCst);
    }

    fn conn_state_hook(&self) -> Option<StateObserver> {
        self.conn_state.clone()
    }
}

/// Errors that concern one connection rather than the listening socket.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

async fn serve_connection<I>(
    io: I,
    conn: Conn,
    router: Router,
    keep_alives: Arc<AtomicBool>,
    observer: StateObserver,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hijacked = Arc::new(AtomicBool::new(false));
    let idle = Arc::new(PendingIdle::new(conn.clone(), Arc::clone(&observer)));

    // Scoped so that the hyper connection, and any response body it still
    // owns, is dropped before `Closed` is reported.
    {
        let service = {
            let conn = conn.clone();
            let observer = Arc::clone(&observer);
            let hijacked = Arc::clone(&hijacked);
            let idle = Arc::clone(&idle);
            service_fn(move |mut req: Request<Incoming>| {
                let router = router.clone();
                let conn = conn.clone();
                let observer = Arc::clone(&observer);
                let keep_alives = Arc::clone(&keep_alives);
                let hijacked = Arc::clone(&hijacked);
                let idle = Arc::clone(&idle);
                async move {
                    // A pipelined request may arrive before the previous
                    // response was flushed; it is not idle then.
                    idle.disarm();
                    observer(&conn, ConnState::Active);
                    req.extensions_mut().insert(conn.clone());

                    let response = match router.oneshot(req).await {
                        Ok(response) => response,
                        Err(never) => match never {},
                    };
                    let (mut parts, body) = response.into_parts();

                    if parts.status == StatusCode::SWITCHING_PROTOCOLS {
                        hijacked.store(true, Ordering::SeqCst);
                        observer(&conn, ConnState::Hijacked);
                        return Ok::<_, Infallible>(Response::from_parts(
                            parts,
                            TrackedBody::untracked(body),
                        ));
                    }

                    if !keep_alives.load(Ordering::SeqCst) {
                        parts
                            .headers
                            .insert(header::CONNECTION, HeaderValue::from_static("close"));
                    }
                    Ok(Response::from_parts(parts, TrackedBody::new(body, idle)))
                }
            })
        };

        let connection = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(FlushNotify::new(io, Arc::clone(&idle))), service)
            .with_upgrades();
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = conn.closed() => {
                debug!("Closing connection on request");
                connection.as_mut().graceful_shutdown();
                connection.as_mut().await
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "Connection ended with error");
        }
    }

    if !hijacked.load(Ordering::SeqCst) {
        observer(&conn, ConnState::Closed);
    }
}

/// `Idle` report of a connection, held back until its response is flushed.
struct PendingIdle {
    armed: AtomicBool,
    conn: Conn,
    observer: StateObserver,
}

impl PendingIdle {
    fn new(conn: Conn, observer: StateObserver) -> Self {
        Self {
            armed: AtomicBool::new(false),
            conn,
            observer,
        }
    }

    /// The response body was released to hyper's write buffer.
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// The transport flushed everything hyper had buffered.
    fn flushed(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            (self.observer)(&self.conn, ConnState::Idle);
        }
    }
}

/// Connection IO that fires the pending `Idle` report on a successful flush.
///
/// hyper only flushes the transport after its own write buffer is empty, so
/// a flush that follows the release of a response body means the whole
/// response reached the socket.
struct FlushNotify<I> {
    inner: I,
    idle: Arc<PendingIdle>,
}

impl<I> FlushNotify<I> {
    fn new(inner: I, idle: Arc<PendingIdle>) -> Self {
        Self { inner, idle }
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for FlushNotify<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for FlushNotify<I> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        this.idle.flushed();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Response body that arms the connection's `Idle` report once released.
struct TrackedBody {
    inner: Body,
    on_release: Option<Arc<PendingIdle>>,
}

impl TrackedBody {
    fn new(inner: Body, idle: Arc<PendingIdle>) -> Self {
        Self {
            inner,
            on_release: Some(idle),
        }
    }

    fn untracked(inner: Body) -> Self {
        Self {
            inner,
            on_release: None,
        }
    }
}

impl HttpBody for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        if let Some(idle) = self.on_release.take() {
            idle.arm();
        }
    }
}
