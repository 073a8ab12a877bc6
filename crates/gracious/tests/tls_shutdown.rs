//! TLS Shutdown Tests
//!
//! The TLS listener must shut down exactly like plain TCP: in-flight requests
//! complete, idle connections are closed, `serve` returns `Ok(())`.
//!
//! Run with: `cargo test -p gracious --test tls_shutdown`

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestClient, TestServer};
use gracious::{load_tls_config, ConnState, TcpKeepAliveListener, TlsListener};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

struct TlsFixture {
    server: TestServer,
    connector: TlsConnector,
    _dir: tempfile::TempDir,
}

async fn start_tls_server() -> TlsFixture {
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let config = load_tls_config(&cert_path, &key_path).unwrap();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = TlsListener::new(TcpKeepAliveListener::new(tcp), config);
    let server = TestServer::start_on(listener, addr);

    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let client_config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    TlsFixture {
        server,
        connector: TlsConnector::from(Arc::new(client_config)),
        _dir: dir,
    }
}

impl TlsFixture {
    async fn connect(&self) -> TestClient<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(self.server.addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let stream = self.connector.connect(name, tcp).await.expect("TLS handshake");
        TestClient::new(stream)
    }
}

#[tokio::test]
async fn test_tls_request_served() {
    let fixture = start_tls_server().await;
    let mut client = fixture.connect().await;

    let response = client.get("/").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hello");

    fixture.server.handle.close();
    fixture.server.join().await.unwrap();
}

#[tokio::test]
async fn test_tls_in_flight_request_survives_shutdown() {
    let fixture = start_tls_server().await;
    let mut client = fixture.connect().await;

    client.send("/sleep/200").await;
    fixture.server.wait_for_state(ConnState::Active, 1).await;
    fixture.server.handle.close();

    let response = client.read_response().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("connection"), Some("close"));
    fixture.server.join().await.unwrap();
}

#[tokio::test]
async fn test_tls_idle_connection_closed_on_shutdown() {
    let fixture = start_tls_server().await;
    let mut client = fixture.connect().await;
    assert_eq!(client.get("/").await.status, 200);
    fixture.server.wait_for_state(ConnState::Idle, 1).await;

    fixture.server.handle.close();
    assert!(client.read_eof(Duration::from_millis(500)).await);
    fixture.server.join().await.unwrap();
}

#[tokio::test]
async fn test_failed_handshake_does_not_block_shutdown() {
    let fixture = start_tls_server().await;

    // Plain-text client against the TLS port.
    let mut plain = TestClient::connect(fixture.server.addr).await;
    plain.send("/").await;
    assert!(plain.read_eof(Duration::from_secs(2)).await);
    fixture.server.wait_for_state(ConnState::Closed, 1).await;

    fixture.server.handle.close();
    fixture.server.join().await.unwrap();
}
