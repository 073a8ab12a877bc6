//! # gracious
//!
//! Graceful shutdown for connection-oriented servers.
//!
//! ## Overview
//!
//! When shutdown is requested a [`GracefulServer`]:
//! 1. Marks itself as closing, so connections that go idle are closed on the spot
//! 2. Disables keep-alives in the serving engine
//! 3. Closes its listener, so no new connection is accepted
//! 4. Closes connections that are already idle
//! 5. Waits until every in-flight request and every opted-in routine has finished
//!
//! and only then returns `Ok(())` from [`GracefulServer::serve`].
//!
//! Connections are counted through the lifecycle notifications of the serving
//! engine (see [`ConnState`]): a connection blocks shutdown while it is new or
//! handling a request, never while it sits idle on keep-alive.
//!
//! ## Signals
//!
//! [`close_on_signals`] closes every server in a [`ServerRegistry`] on the first
//! of `SIGINT`, `SIGTERM`, `SIGQUIT`, `SIGHUP` or `SIGUSR1` (configurable).
//!
//! ## Environment Variables
//!
//! - `GRACIOUS_DRAIN_TIMEOUT_SECS`: Upper bound on the drain phase (default: none)
//! - `GRACIOUS_SIGNALS`: Comma-separated signal names that trigger shutdown
//! - `LISTEN_FDS` / `LISTEN_FD_NAMES`: Listeners inherited from a parent process
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("gracious requires a Unix platform (Linux or macOS)");

mod config;
mod drain;
mod engine;
mod error;
mod handoff;
mod listener;
mod registry;
mod server;
mod signal;
mod tls;
mod tracker;

pub use config::ShutdownConfig;
pub use drain::{DrainCounter, RoutineGuard};
pub use engine::{Engine, HttpEngine, StateObserver};
pub use error::{Error, Result};
pub use handoff::{spawn_successor, spawn_with_listeners, tcp_listener_from_fd, ListenerSet};
pub use listener::{
    is_listener_closed, BindAddr, GracefulListener, Listener, ListenerClosed, ListenerHandle,
    TcpKeepAliveListener,
};
pub use registry::ServerRegistry;
pub use server::{GracefulServer, Options, Phase, ServerHandle};
pub use signal::{close_on_signals, Signal};
pub use tls::{load_tls_config, TlsConn, TlsListener};
pub use tracker::{drain_effect, Conn, ConnId, ConnState, ConnTracker, DrainEffect, StateHandler};
