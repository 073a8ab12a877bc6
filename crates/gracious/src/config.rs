//! Shutdown configuration from the environment.

use std::time::Duration;

use tracing::warn;

use crate::signal::Signal;

const DRAIN_TIMEOUT_VAR: &str = "GRACIOUS_DRAIN_TIMEOUT_SECS";
const SIGNALS_VAR: &str = "GRACIOUS_SIGNALS";

/// Shutdown settings shared by every server in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Upper bound on the drain phase. `None` waits forever.
    pub drain_timeout: Option<Duration>,
    /// Signals that trigger a graceful shutdown.
    pub signals: Vec<Signal>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: None,
            signals: Signal::DEFAULT.to_vec(),
        }
    }
}

impl ShutdownConfig {
    /// Read `GRACIOUS_DRAIN_TIMEOUT_SECS` and `GRACIOUS_SIGNALS`.
    ///
    /// Unset, empty or invalid values fall back to the defaults; invalid ones
    /// are logged.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(DRAIN_TIMEOUT_VAR).ok().as_deref(),
            std::env::var(SIGNALS_VAR).ok().as_deref(),
        )
    }

    fn from_vars(drain_timeout: Option<&str>, signals: Option<&str>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = drain_timeout.map(str::trim).filter(|v| !v.is_empty()) {
            match raw.parse::<u64>() {
                Ok(0) => {}
                Ok(secs) => config.drain_timeout = Some(Duration::from_secs(secs)),
                Err(e) => warn!(var = DRAIN_TIMEOUT_VAR, value = raw, error = %e, "Ignoring invalid drain timeout"),
            }
        }

        if let Some(raw) = signals.filter(|v| !v.trim().is_empty()) {
            let mut parsed = Vec::new();
            for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match name.parse::<Signal>() {
                    Ok(sig) if !parsed.contains(&sig) => parsed.push(sig),
                    Ok(_) => {}
                    Err(e) => warn!(var = SIGNALS_VAR, error = %e, "Ignoring unknown signal"),
                }
            }
            if !parsed.is_empty() {
                config.signals = parsed;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShutdownConfig::from_vars(None, None);
        assert_eq!(config, ShutdownConfig::default());
        assert_eq!(config.drain_timeout, None);
        assert_eq!(config.signals, Signal::DEFAULT);
    }

    #[test]
    fn test_drain_timeout() {
        let config = ShutdownConfig::from_vars(Some("30"), None);
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(30)));

        assert_eq!(ShutdownConfig::from_vars(Some("0"), None).drain_timeout, None);
        assert_eq!(ShutdownConfig::from_vars(Some("soon"), None).drain_timeout, None);
    }

    #[test]
    fn test_signal_list() {
        let config = ShutdownConfig::from_vars(None, Some("term, usr2,bogus,SIGTERM"));
        assert_eq!(config.signals, vec![Signal::Terminate, Signal::User2]);

        let config = ShutdownConfig::from_vars(None, Some("bogus"));
        assert_eq!(config.signals, Signal::DEFAULT);
    }
}
