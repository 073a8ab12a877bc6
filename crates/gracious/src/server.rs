//! Graceful server.
//!
//! [`GracefulServer::serve`] runs an [`Engine`] on a listener and, once
//! [`ServerHandle::close`] is called:
//! - marks the connection tracker as closing
//! - disables keep-alives in the engine
//! - closes the listener
//! - closes connections that are idle right now
//!
//! and then waits for the drain counter to reach zero before returning `Ok(())`.

use std::fmt;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rustls::ServerConfig;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drain::{DrainCounter, RoutineGuard};
use crate::engine::{Engine, HttpEngine, StateObserver};
use crate::error::{Error, Result};
use crate::listener::{BindAddr, GracefulListener, Listener, ListenerHandle, TcpKeepAliveListener};
use crate::tls::{load_tls_config, TlsListener};
use crate::tracker::{ConnTracker, StateHandler};

/// Lifecycle phase of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting connections (or not started yet).
    Running,
    /// Listener closed, waiting for in-flight work.
    ShuttingDown,
    /// `serve` has returned.
    Stopped,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Running,
            1 => Phase::ShuttingDown,
            _ => Phase::Stopped,
        }
    }
}

/// Cloneable handle that closes a server and counts routines against its drain.
///
/// Every clone refers to the same server.
#[derive(Clone, Default)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

#[derive(Default)]
struct HandleInner {
    shutdown: CancellationToken,
    closed: AtomicBool,
    drain: DrainCounter,
    phase: AtomicU8,
}

impl ServerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    ///
    /// Returns `true` for the call that requested it; later calls do nothing
    /// and return `false`.
    pub fn close(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        if first {
            info!("Graceful shutdown requested");
            self.inner.shutdown.cancel();
        }
        first
    }

    /// Whether shutdown was requested.
    pub fn is_closing(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Count one routine that shutdown must wait for.
    ///
    /// Must be paired with exactly one [`finish_routine`](Self::finish_routine).
    pub fn start_routine(&self) {
        self.inner.drain.increase();
    }

    /// Mark a routine started with [`start_routine`](Self::start_routine) as done.
    pub fn finish_routine(&self) {
        self.inner.drain.decrease();
    }

    /// Count a routine for as long as the returned guard lives.
    pub fn routine(&self) -> RoutineGuard {
        self.inner.drain.guard()
    }

    /// Connections in flight plus running routines.
    pub fn in_flight(&self) -> usize {
        self.inner.drain.count()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn drain(&self) -> &DrainCounter {
        &self.inner.drain
    }

    async fn shutdown_requested(&self) {
        self.inner.shutdown.cancelled().await
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("closing", &self.is_closing())
            .field("in_flight", &self.in_flight())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Construction options for [`GracefulServer::with_options`].
pub struct Options<E> {
    pub engine: E,
    /// Called with `(conn, previous, new)` on every connection transition.
    pub state_handler: Option<StateHandler>,
    /// Upper bound on the drain phase. `None` waits forever.
    pub drain_timeout: Option<Duration>,
    /// Pre-built handle, e.g. one already handed to request handlers.
    pub handle: Option<ServerHandle>,
}

impl<E> Options<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state_handler: None,
            drain_timeout: None,
            handle: None,
        }
    }
}

/// Server that shuts down without dropping in-flight requests.
pub struct GracefulServer<E = HttpEngine> {
    engine: E,
    handle: ServerHandle,
    tracker: Arc<ConnTracker>,
    state_handler: Option<StateHandler>,
    drain_timeout: Option<Duration>,
}

impl GracefulServer<HttpEngine> {
    /// Serve `router` on the bundled HTTP/1.1 engine.
    pub fn new(router: Router) -> Self {
        Self::with_engine(HttpEngine::new(router))
    }
}

impl<E: Engine> GracefulServer<E> {
    pub fn with_engine(engine: E) -> Self {
        Self::with_options(Options::new(engine))
    }

    pub fn with_options(options: Options<E>) -> Self {
        let handle = options.handle.unwrap_or_default();
        let tracker = Arc::new(ConnTracker::new(handle.drain().clone()));
        Self {
            engine: options.engine,
            handle,
            tracker,
            state_handler: options.state_handler,
            drain_timeout: options.drain_timeout,
        }
    }

    pub fn with_state_handler(mut self, handler: StateHandler) -> Self {
        self.state_handler = Some(handler);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Request shutdown. See [`ServerHandle::close`].
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    pub fn start_routine(&self) {
        self.handle.start_routine();
    }

    pub fn finish_routine(&self) {
        self.handle.finish_routine();
    }

    pub fn routine(&self) -> RoutineGuard {
        self.handle.routine()
    }

    pub fn in_flight(&self) -> usize {
        self.handle.in_flight()
    }

    pub fn tracker(&self) -> &ConnTracker {
        &self.tracker
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Serve connections from `listener` until shutdown.
    ///
    /// Returns `Ok(())` after a requested shutdown once every in-flight
    /// request and routine has finished. An engine error that happens while
    /// no shutdown was requested is returned unchanged.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        let listener = GracefulListener::new(listener);
        let listener_handle = listener.handle();
        if let Ok(addr) = listener.local_addr() {
            info!(addr = ?addr, "Serving");
        }

        let result = {
            let serving = self.engine.serve(listener, self.observer());
            tokio::pin!(serving);
            tokio::select! {
                biased;
                _ = self.handle.shutdown_requested() => {
                    self.begin_shutdown(&listener_handle);
                    serving.await
                }
                result = &mut serving => result,
            }
        };

        let outcome = match result {
            Err(e) if !self.handle.is_closing() => Err(Error::Io(e)),
            result => {
                if let Err(e) = result {
                    debug!(error = %e, "Accept loop ended by shutdown");
                }
                // Shutdown may have been requested after the engine stopped.
                self.begin_shutdown(&listener_handle);
                self.wait_for_drain().await
            }
        };

        self.handle.set_phase(Phase::Stopped);
        outcome
    }

    /// Bind `addr` and serve on it.
    ///
    /// A leading `/` binds a unix socket at that path, which is removed once
    /// serving ends. Anything else is a TCP `host:port` with keep-alive probes.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<()> {
        match addr.parse::<BindAddr>()? {
            BindAddr::Unix(path) => {
                let listener = bind_unix(&path)?;
                let result = self.serve(listener).await;
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
                result
            }
            BindAddr::Tcp(addr) => {
                let listener = TcpKeepAliveListener::bind(&addr).await?;
                self.serve(listener).await
            }
        }
    }

    /// Bind `addr` and serve TLS with the given PEM certificate chain and key.
    pub async fn listen_and_serve_tls(
        &self,
        addr: &str,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let config = load_tls_config(cert_path, key_path)?;
        self.listen_and_serve_tls_with_config(addr, config).await
    }

    /// Bind `addr` and serve TLS with a prepared configuration.
    ///
    /// An empty ALPN list defaults to `http/1.1`.
    pub async fn listen_and_serve_tls_with_config(
        &self,
        addr: &str,
        config: Arc<ServerConfig>,
    ) -> Result<()> {
        match addr.parse::<BindAddr>()? {
            BindAddr::Unix(_) => Err(Error::invalid_address(addr, "TLS needs a TCP address")),
            BindAddr::Tcp(addr) => {
                let listener = TcpKeepAliveListener::bind(&addr).await?;
                self.serve(TlsListener::new(listener, config)).await
            }
        }
    }

    /// Observer handed to the engine: tracker first, then the host's state
    /// handler, then whatever hook the engine itself carries.
    fn observer(&self) -> StateObserver {
        let tracker = Arc::clone(&self.tracker);
        let state_handler = self.state_handler.clone();
        let hook = self.engine.conn_state_hook();
        Arc::new(move |conn, state| {
            let previous = tracker.transition(conn, state);
            if let Some(handler) = &state_handler {
                handler(conn, previous, state);
            }
            if let Some(hook) = &hook {
                hook(conn, state);
            }
        })
    }

    fn begin_shutdown(&self, listener: &ListenerHandle) {
        if self.tracker.is_closing() {
            // A later `serve` on a server that was already shut down.
            listener.close();
            return;
        }
        self.handle.set_phase(Phase::ShuttingDown);
        self.tracker.set_closing();
        self.engine.set_keep_alives_enabled(false);
        listener.close();
        let idle = self.tracker.close_idle();
        info!(
            idle_closed = idle,
            in_flight = self.handle.in_flight(),
            "Stopped accepting connections"
        );
    }

    async fn wait_for_drain(&self) -> Result<()> {
        let drain = self.handle.drain();
        if drain.count() > 0 {
            info!(in_flight = drain.count(), "Draining in-flight work");
        }

        match self.drain_timeout {
            None => drain.wait().await,
            Some(timeout) => {
                if !drain.wait_timeout(timeout).await {
                    let remaining = drain.count();
                    warn!(
                        remaining,
                        timeout_secs = timeout.as_secs_f64(),
                        "Drain timeout expired"
                    );
                    return Err(Error::DrainTimeout { remaining });
                }
            }
        }

        info!("Drained, server stopped");
        Ok(())
    }
}

impl<E> fmt::Debug for GracefulServer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulServer")
            .field("handle", &self.handle)
            .field("tracker", &self.tracker)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

/// Bind a unix socket at `path` and make it accessible to every local user.
fn bind_unix(path: &Path) -> Result<UnixListener> {
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, Permissions::from_mode(0o777))?;
    info!(path = %path.display(), "Listening on unix socket");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Conn, ConnState};
    use axum::routing::get;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::net::{TcpListener, TcpStream};

    struct FailingListener;

    impl Listener for FailingListener {
        type Io = TcpStream;
        type Addr = SocketAddr;

        fn accept(&self) -> impl std::future::Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            std::future::ready(Err::<(TcpStream, SocketAddr), _>(io::Error::other("boom")))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Err(io::Error::other("unbound"))
        }
    }

    fn router() -> Router {
        Router::new().route("/", get(|| async { "ok" }))
    }

    #[test]
    fn test_close_is_idempotent() {
        let handle = ServerHandle::new();
        assert!(!handle.is_closing());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.clone().is_closing());
    }

    #[test]
    fn test_routine_counting() {
        let server = GracefulServer::new(router());
        server.start_routine();
        let guard = server.routine();
        assert_eq!(server.in_flight(), 2);

        server.finish_routine();
        drop(guard);
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_before_serve_accepts_nothing() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let handler: StateHandler = {
            let events = Arc::clone(&events);
            Arc::new(move |_conn: &Conn, _prev: Option<ConnState>, state: ConnState| {
                events.lock().unwrap().push(state)
            })
        };
        let server = GracefulServer::new(router()).with_state_handler(handler);
        assert!(server.close());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.serve(listener))
            .await
            .expect("serve should return promptly")
            .unwrap();

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(server.handle().phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_serve_after_shutdown_returns() {
        let server = GracefulServer::new(router());
        server.close();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve(listener).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.serve(listener))
            .await
            .expect("second serve should not keep accepting")
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
        assert_eq!(server.handle().phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_engine_error_propagates() {
        let server = GracefulServer::new(router());
        let err = server.serve(FailingListener).await.unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.to_string() == "boom"));
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_reports_remaining() {
        let server = GracefulServer::new(router()).with_drain_timeout(Duration::from_millis(50));
        let _guard = server.routine();
        server.close();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let err = server.serve(listener).await.unwrap_err();
        assert!(matches!(err, Error::DrainTimeout { remaining: 1 }));
    }

    #[tokio::test]
    async fn test_phase_follows_shutdown() {
        let server = Arc::new(GracefulServer::new(router()));
        let handle = server.handle();
        assert_eq!(handle.phase(), Phase::Running);

        let guard = handle.routine();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                server.serve(listener).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.phase(), Phase::ShuttingDown);
        assert!(!serving.is_finished());

        drop(guard);
        serving.await.unwrap().unwrap();
        assert_eq!(handle.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_unix_socket_is_removed_after_serve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracious.sock");
        let addr = path.to_str().unwrap().to_string();

        let server = Arc::new(GracefulServer::new(router()));
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.listen_and_serve(&addr).await })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        server.close();
        serving.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tls_on_unix_path_is_rejected() {
        let server = GracefulServer::new(router());
        let config = Arc::new(
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
        );
        let err = server
            .listen_and_serve_tls_with_config("/tmp/never.sock", config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
    }
}
