//! Connection state tracking.
//!
//! The serving engine reports every connection lifecycle transition. The
//! tracker remembers the last state of each live connection and turns each
//! transition into at most one step on the [`DrainCounter`], so that every
//! connection contributes exactly one net increment over its lifetime.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::drain::DrainCounter;

/// Lifecycle state of a connection as reported by the serving engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepted, no request read yet.
    New,
    /// Reading or handling a request, or writing its response.
    Active,
    /// Between requests on a keep-alive connection.
    Idle,
    /// Connection ended.
    Closed,
    /// Connection taken over by the handler (protocol upgrade).
    Hijacked,
}

impl ConnState {
    /// Whether this state ends the connection's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Hijacked)
    }

    /// Whether a connection in this state holds shutdown back.
    fn in_flight(self) -> bool {
        matches!(self, ConnState::New | ConnState::Active)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::New => write!(f, "new"),
            ConnState::Active => write!(f, "active"),
            ConnState::Idle => write!(f, "idle"),
            ConnState::Closed => write!(f, "closed"),
            ConnState::Hijacked => write!(f, "hijacked"),
        }
    }
}

/// Effect of a single transition on the drain counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEffect {
    /// Count the connection as in flight.
    Increase,
    /// Stop counting the connection.
    Decrease,
    /// Leave the counter alone.
    Unchanged,
}

/// Drain counter effect of moving from `previous` (unknown if `None`) to `next`.
///
/// | previous       | next              | effect            |
/// |----------------|-------------------|-------------------|
/// | none           | New               | increase          |
/// | Idle           | Active            | increase          |
/// | New            | Active            | unchanged         |
/// | Active         | Idle              | decrease          |
/// | Idle           | Closed / Hijacked | unchanged         |
/// | New / Active   | Closed / Hijacked | decrease          |
///
/// Repeated notifications of the same state are unchanged.
pub fn drain_effect(previous: Option<ConnState>, next: ConnState) -> DrainEffect {
    let was = previous.is_some_and(ConnState::in_flight);
    match (was, next.in_flight()) {
        (false, true) => DrainEffect::Increase,
        (true, false) => DrainEffect::Decrease,
        _ => DrainEffect::Unchanged,
    }
}

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric identifier.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle on a live connection, shared between the engine and the tracker.
///
/// Closing it asks the engine to finish any response in progress and then
/// drop the connection.
#[derive(Debug, Clone)]
pub struct Conn {
    id: ConnId,
    close: CancellationToken,
}

impl Conn {
    /// Create a handle for a freshly accepted connection.
    pub fn new() -> Self {
        Self {
            id: ConnId::next(),
            close: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Ask the engine to close this connection.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`Conn::close`] has been called.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// Host callback receiving `(connection, previous state, new state)` for every transition.
///
/// `previous` is `None` for the first notification of a connection.
pub type StateHandler = Arc<dyn Fn(&Conn, Option<ConnState>, ConnState) + Send + Sync>;

struct Tracked {
    conn: Conn,
    state: ConnState,
}

/// Maps live connections to their last observed state and keeps the drain
/// counter in step with them.
pub struct ConnTracker {
    conns: DashMap<ConnId, Tracked>,
    drain: DrainCounter,
    closing: AtomicBool,
}

impl ConnTracker {
    /// Create a tracker that reports to `drain`.
    pub fn new(drain: DrainCounter) -> Self {
        Self {
            conns: DashMap::new(),
            drain,
            closing: AtomicBool::new(false),
        }
    }

    /// Record a transition of `conn` to `next` and apply its drain effect.
    ///
    /// Returns the previously recorded state. While closing, a connection
    /// that becomes idle is closed immediately so it cannot start another
    /// request.
    pub fn transition(&self, conn: &Conn, next: ConnState) -> Option<ConnState> {
        let previous = if next.is_terminal() {
            self.conns.remove(&conn.id()).map(|(_, tracked)| tracked.state)
        } else {
            self.conns
                .insert(
                    conn.id(),
                    Tracked {
                        conn: conn.clone(),
                        state: next,
                    },
                )
                .map(|tracked| tracked.state)
        };

        match drain_effect(previous, next) {
            DrainEffect::Increase => self.drain.increase(),
            DrainEffect::Decrease => self.drain.decrease(),
            DrainEffect::Unchanged => {}
        }

        if next == ConnState::Idle && self.is_closing() {
            debug!(conn = %conn.id(), "Closing connection that went idle during shutdown");
            conn.close();
        }

        previous
    }

    /// Switch into shutdown mode: idle transitions now close the connection.
    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Close every connection currently idle. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let mut closed = 0;
        for entry in self.conns.iter() {
            if entry.state == ConnState::Idle {
                entry.conn.close();
                closed += 1;
            }
        }
        closed
    }

    /// Last recorded state of a live connection.
    pub fn state_of(&self, id: ConnId) -> Option<ConnState> {
        self.conns.get(&id).map(|tracked| tracked.state)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// The drain counter this tracker reports to.
    pub fn drain(&self) -> &DrainCounter {
        &self.drain
    }
}

impl fmt::Debug for ConnTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnTracker")
            .field("connections", &self.len())
            .field("in_flight", &self.drain.count())
            .field("closing", &self.is_closing())
            .finish()
    }
}
