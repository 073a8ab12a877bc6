use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gracious::{
    close_on_signals, load_tls_config, spawn_successor, BindAddr, GracefulServer, HttpEngine,
    ListenerSet, Options, ServerHandle, ServerRegistry, ShutdownConfig, Signal,
    TcpKeepAliveListener, TlsListener,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

mod routes;
mod telemetry;

use telemetry::LogFormat;

/// Name of the listener handed to a successor process.
const HTTP_LISTENER: &str = "http";

#[derive(Parser)]
#[command(name = "gracious-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address: `host:port`, `:port` (all interfaces) or a unix socket path
    #[arg(short, long, default_value = ":8080")]
    addr: String,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Signal that triggers a graceful shutdown (repeatable, overrides GRACIOUS_SIGNALS)
    #[arg(short, long = "signal")]
    signals: Vec<Signal>,

    /// Give up draining after this many seconds (0 waits forever)
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// On SIGUSR2 start a successor with our listener, then drain and exit
    #[arg(long)]
    handoff_on_usr2: bool,

    /// Console log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Cli {
    fn shutdown_config(&self) -> ShutdownConfig {
        let mut config = ShutdownConfig::from_env();
        if !self.signals.is_empty() {
            config.signals = self.signals.clone();
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.drain_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("gracious-server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = cli.shutdown_config();
    if cli.handoff_on_usr2 && config.signals.contains(&Signal::User2) {
        warn!("SIGUSR2 is configured as a shutdown signal; it will close without handing off");
    }

    let handle = ServerHandle::new();
    let mut options = Options::new(HttpEngine::new(routes::router(handle.clone())));
    options.drain_timeout = config.drain_timeout;
    options.handle = Some(handle.clone());
    let server = GracefulServer::with_options(options);

    let registry = Arc::new(ServerRegistry::new());
    registry.register(server.handle());
    let signal_task = close_on_signals(Arc::clone(&registry), &config.signals)
        .context("Failed to install signal handlers")?;

    let result = run(&cli, &server, &registry).await;
    signal_task.abort();
    result?;

    info!("gracious-server stopped");
    Ok(())
}

async fn run(cli: &Cli, server: &GracefulServer, registry: &Arc<ServerRegistry>) -> Result<()> {
    // Inherited listeners win over --addr: the parent already bound it.
    let listener = match ListenerSet::from_env()? {
        Some(mut inherited) => {
            info!("Inherited listener from parent process");
            let listener = inherited.take(HTTP_LISTENER)?;
            inherited.ensure_empty()?;
            TcpKeepAliveListener::new(listener)
        }
        None => match cli.addr.parse::<BindAddr>()? {
            BindAddr::Unix(path) => {
                if cli.handoff_on_usr2 {
                    warn!("Listener handoff is only supported for TCP listeners");
                }
                if cli.tls_cert.is_some() {
                    anyhow::bail!("TLS needs a TCP address, got {}", path.display());
                }
                server.listen_and_serve(&cli.addr).await?;
                return Ok(());
            }
            BindAddr::Tcp(addr) => TcpKeepAliveListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?,
        },
    };

    if cli.handoff_on_usr2 {
        let fd = listener
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate listener for handoff")?;
        spawn_handoff(fd, Arc::clone(registry))?;
    }

    match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = load_tls_config(cert, key)?;
            server.serve(TlsListener::new(listener, tls)).await?;
        }
        _ => server.serve(listener).await?,
    }
    Ok(())
}

/// On every SIGUSR2 try to start a successor holding our listener; once one
/// is running, close all servers so this process drains and exits.
fn spawn_handoff(listener: OwnedFd, registry: Arc<ServerRegistry>) -> Result<()> {
    let mut usr2 = signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;
    info!("Listener handoff armed on SIGUSR2");

    tokio::spawn(async move {
        while usr2.recv().await.is_some() {
            match spawn_successor(&[(HTTP_LISTENER, listener.as_fd())]) {
                Ok(child) => {
                    info!(pid = child.id(), "Successor started, draining this process");
                    registry.close_all();
                    return;
                }
                Err(e) => error!(error = %e, "Failed to start successor, still serving"),
            }
        }
    });
    Ok(())
}
