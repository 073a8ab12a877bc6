//! Shared fixtures for the graceful shutdown tests: a raw HTTP/1.1 client
//! and a server running a small router with slow and background routes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Router};
use gracious::{
    Conn, ConnId, ConnState, GracefulServer, HttpEngine, Listener, Options, ServerHandle,
    StateHandler,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing once per test binary.
pub fn init_test() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("gracious=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Counter of background jobs that ran to completion.
#[derive(Clone, Default)]
pub struct Finished(Arc<AtomicUsize>);

impl Finished {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Routes:
/// - `/` answers immediately
/// - `/sleep/:ms` answers after `ms` milliseconds
/// - `/background/:ms` answers immediately and keeps a counted routine running for `ms`
/// - `/bytes/:len` answers with a body of `len` bytes
pub fn router(handle: ServerHandle, finished: Finished) -> Router {
    Router::new()
        .route("/", get(|| async { "hello" }))
        .route(
            "/sleep/:ms",
            get(|Path(ms): Path<u64>| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                format!("slept {ms}")
            }),
        )
        .route(
            "/background/:ms",
            get(
                |Path(ms): Path<u64>,
                 Extension(handle): Extension<ServerHandle>,
                 Extension(finished): Extension<Finished>| async move {
                    let guard = handle.routine();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        finished.0.fetch_add(1, Ordering::SeqCst);
                        drop(guard);
                    });
                    "started"
                },
            ),
        )
        .route(
            "/bytes/:len",
            get(|Path(len): Path<usize>| async move { vec![b'x'; len] }),
        )
        .layer(Extension(handle))
        .layer(Extension(finished))
}

pub type Event = (ConnId, Option<ConnState>, ConnState);

/// A server running on its own task.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub events: Arc<Mutex<Vec<Event>>>,
    pub finished: Finished,
    pub task: JoinHandle<gracious::Result<()>>,
}

impl TestServer {
    /// Serve the test router on an ephemeral localhost port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self::start_on(listener, addr)
    }

    /// Serve the test router on `listener`, which accepts on `addr`.
    pub fn start_on<L: Listener>(listener: L, addr: SocketAddr) -> Self {
        init_test();
        let handle = ServerHandle::new();
        let finished = Finished::default();
        let events: Arc<Mutex<Vec<Event>>> = Arc::default();

        let state_handler: StateHandler = {
            let events = Arc::clone(&events);
            Arc::new(
                move |conn: &Conn, previous: Option<ConnState>, state: ConnState| {
                    events.lock().unwrap().push((conn.id(), previous, state));
                },
            )
        };

        let mut options = Options::new(HttpEngine::new(router(handle.clone(), finished.clone())));
        options.state_handler = Some(state_handler);
        options.handle = Some(handle.clone());
        let server = GracefulServer::with_options(options);

        let task = tokio::spawn(async move { server.serve(listener).await });
        Self {
            addr,
            handle,
            events,
            finished,
            task,
        }
    }

    pub async fn connect(&self) -> TestClient<TcpStream> {
        TestClient::connect(self.addr).await
    }

    /// Wait for `serve` to return.
    pub async fn join(self) -> gracious::Result<()> {
        tokio::time::timeout(DEFAULT_TIMEOUT, self.task)
            .await
            .expect("serve did not return")
            .expect("serve task panicked")
    }

    /// Wait until some connection reached `state`.
    pub async fn wait_for_state(&self, state: ConnState, times: usize) {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            loop {
                let seen = self
                    .events
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, _, s)| *s == state)
                    .count();
                if seen >= times {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection state never reached");
    }
}

/// Parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 client over any byte stream.
pub struct TestClient<S> {
    reader: BufReader<S>,
}

impl TestClient<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.expect("connect"))
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send a keep-alive `GET path`.
    pub async fn send(&mut self, path: &str) {
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let stream = self.reader.get_mut();
        stream.write_all(request.as_bytes()).await.expect("send request");
        stream.flush().await.expect("flush request");
    }

    /// Send a `GET path` that asks the server to close afterwards.
    pub async fn send_closing(&mut self, path: &str) {
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        let stream = self.reader.get_mut();
        stream.write_all(request.as_bytes()).await.expect("send request");
        stream.flush().await.expect("flush request");
    }

    pub async fn read_response(&mut self) -> TestResponse {
        tokio::time::timeout(DEFAULT_TIMEOUT, self.read_response_inner())
            .await
            .expect("response timed out")
    }

    pub async fn get(&mut self, path: &str) -> TestResponse {
        self.send(path).await;
        self.read_response().await
    }

    /// Whether the server closed the connection within `within`.
    ///
    /// Stray bytes (e.g. a TLS alert) before the close are skipped.
    pub async fn read_eof(&mut self, within: Duration) -> bool {
        let mut buf = [0u8; 256];
        let closed = async {
            loop {
                match self.reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        };
        tokio::time::timeout(within, closed).await.is_ok()
    }

    async fn read_response_inner(&mut self) -> TestResponse {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read status line");
        let status = line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or_else(|| panic!("bad status line: {line:?}"));

        let mut headers = Vec::new();
        loop {
            line.clear();
            self.reader.read_line(&mut line).await.expect("read header");
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await.expect("read body");

        TestResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        }
    }
}
