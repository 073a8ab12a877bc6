//! Server registry.
//!
//! Owned by whatever bootstraps the process. Servers register their handle,
//! and a single [`ServerRegistry::close_all`] (usually driven by
//! [`close_on_signals`](crate::close_on_signals)) shuts every one of them down.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use axum::Router;
use tracing::info;

use crate::error::Result;
use crate::listener::Listener;
use crate::server::{GracefulServer, ServerHandle};

/// Ordered set of running servers.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: Mutex<Vec<ServerHandle>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ServerHandle) {
        self.lock().push(handle);
    }

    /// Close every registered server and forget them.
    ///
    /// Returns how many servers were closed. A repeated call does not touch
    /// servers closed by an earlier one.
    pub fn close_all(&self) -> usize {
        let servers = std::mem::take(&mut *self.lock());
        for server in &servers {
            server.close();
        }
        if !servers.is_empty() {
            info!(servers = servers.len(), "Closed all registered servers");
        }
        servers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Build a server for `router`, register it and serve on `addr`.
    pub async fn listen_and_serve(&self, addr: &str, router: Router) -> Result<()> {
        self.add(router).listen_and_serve(addr).await
    }

    /// Build a server for `router`, register it and serve TLS on `addr`.
    pub async fn listen_and_serve_tls(
        &self,
        addr: &str,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        router: Router,
    ) -> Result<()> {
        self.add(router)
            .listen_and_serve_tls(addr, cert_path, key_path)
            .await
    }

    /// Build a server for `router`, register it and serve on `listener`.
    pub async fn serve<L: Listener>(&self, listener: L, router: Router) -> Result<()> {
        self.add(router).serve(listener).await
    }

    fn add(&self, router: Router) -> GracefulServer {
        let server = GracefulServer::new(router);
        self.register(server.handle());
        server
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ServerHandle>> {
        // Membership stays consistent even if a holder panicked.
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
