//! Error types for the graceful server.

use thiserror::Error;

/// Errors reported by listeners, servers and listener handoff.
#[derive(Debug, Error)]
pub enum Error {
    /// Accept or serve failure unrelated to a requested shutdown, passed through unchanged.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The bind address could not be parsed.
    #[error("Invalid bind address {addr:?}: {reason}")]
    InvalidAddress {
        /// Address as given by the caller
        addr: String,
        /// What is wrong with it
        reason: String,
    },

    /// Certificate or key material could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Listeners passed by the parent process are inconsistent.
    #[error("Inherited listener error: {0}")]
    Inherit(String),

    /// Signal name not recognised.
    #[error("Unknown signal {0:?}")]
    UnknownSignal(String),

    /// The drain phase outlived the configured timeout.
    #[error("Drain timed out with {remaining} routines still in flight")]
    DrainTimeout {
        /// Routines still counted when the timeout fired
        remaining: usize,
    },
}

impl Error {
    /// Create a new invalid address error.
    pub fn invalid_address(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a new inherited listener error.
    pub fn inherit(msg: impl Into<String>) -> Self {
        Self::Inherit(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
