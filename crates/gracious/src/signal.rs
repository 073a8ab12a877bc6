//! OS signal bridge.
//!
//! A received signal is just another caller of [`ServerRegistry::close_all`].

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::select_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Error;
use crate::registry::ServerRegistry;

/// Signals that can trigger a graceful shutdown.
///
/// `SIGKILL` cannot be caught and is not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    User1,
    User2,
}

impl Signal {
    /// Signals handled when none are configured.
    pub const DEFAULT: &'static [Signal] = &[
        Signal::Interrupt,
        Signal::Terminate,
        Signal::Quit,
        Signal::Hangup,
        Signal::User1,
    ];

    pub fn kind(self) -> SignalKind {
        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
            Signal::User1 => SignalKind::user_defined1(),
            Signal::User2 => SignalKind::user_defined2(),
        }
    }

    /// Conventional `SIG*` name.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
            Signal::User2 => "SIGUSR2",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Accepts `int`, `SIGINT`, `interrupt` and the like, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("sig").unwrap_or(&lower);
        match name {
            "int" | "interrupt" => Ok(Signal::Interrupt),
            "term" | "terminate" => Ok(Signal::Terminate),
            "quit" => Ok(Signal::Quit),
            "hup" | "hangup" => Ok(Signal::Hangup),
            "usr1" | "user1" => Ok(Signal::User1),
            "usr2" | "user2" => Ok(Signal::User2),
            _ => Err(Error::UnknownSignal(s.to_string())),
        }
    }
}

/// Close every server in `registry` on the first of `signals`.
///
/// Handlers are installed before this returns, so a signal delivered right
/// after the call is not lost. An empty `signals` means [`Signal::DEFAULT`].
/// The returned task resolves to the signal that fired.
pub fn close_on_signals(
    registry: Arc<ServerRegistry>,
    signals: &[Signal],
) -> io::Result<JoinHandle<Option<Signal>>> {
    let signals = if signals.is_empty() {
        Signal::DEFAULT
    } else {
        signals
    };

    let mut streams = Vec::with_capacity(signals.len());
    for &sig in signals {
        streams.push((sig, signal(sig.kind())?));
    }
    info!(signals = ?signals, "Installed shutdown signal handlers");

    Ok(tokio::spawn(async move {
        let received = streams.iter_mut().map(|(sig, stream)| {
            let sig = *sig;
            Box::pin(async move { stream.recv().await.map(|()| sig) })
        });
        let (received, _, _) = select_all(received).await;
        let sig = received?;

        info!(signal = %sig, "Received signal, shutting down servers");
        registry.close_all();
        Some(sig)
    }))
}
