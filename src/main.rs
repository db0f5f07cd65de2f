//! RA-TLS proxy binary.
//!
//! Run with:
//! ```bash
//! ra-tls-proxy superlink.example:9092 --listen-port 8443 --dcap-library ./libdcap_quoteverify.so
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use ra_tls_proxy::config::{self, DEFAULT_BUFFER_SIZE};
use ra_tls_proxy::dcap::{DcapOracle, DEFAULT_LIBRARY_PATH};
use ra_tls_proxy::logging::init_logging;
use ra_tls_proxy::{parse_upstream, ProxyConfig, RaTlsProxy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ra-tls-proxy")]
#[command(about = "Run the RA-TLS transparent proxy")]
struct Args {
    /// Target upstream in host:port format
    upstream: String,

    /// Listening interface
    #[arg(long, env = "RA_TLS_LISTEN_HOST", default_value = "0.0.0.0")]
    listen_host: String,

    /// Listening port
    #[arg(long, env = "RA_TLS_LISTEN_PORT", default_value_t = 8443)]
    listen_port: u16,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "RA_TLS_CONNECT_TIMEOUT", default_value_t = 10.0)]
    connect_timeout: f64,

    /// TLS handshake timeout in seconds
    #[arg(long, env = "RA_TLS_HANDSHAKE_TIMEOUT", default_value_t = 30.0)]
    handshake_timeout: f64,

    /// Concrete host/IP used for upstream TCP sockets
    #[arg(long, env = "RA_TLS_UPSTREAM_CONNECT_HOST")]
    upstream_connect_host: Option<String>,

    /// Relay buffer size in bytes
    #[arg(long, env = "RA_TLS_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Path to the DCAP quote verification library
    #[arg(long, env = "DCAP_LIBRARY_PATH", default_value = DEFAULT_LIBRARY_PATH)]
    dcap_library: String,

    /// Logging level
    #[arg(long, env = "RA_TLS_LOG_LEVEL", default_value = "INFO")]
    log_level: String,
}

impl Args {
    fn proxy_config(&self) -> Result<ProxyConfig> {
        let (upstream_host, upstream_port) = parse_upstream(&self.upstream)?;

        Ok(ProxyConfig {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            upstream_host,
            upstream_port,
            upstream_connect_host: self
                .upstream_connect_host
                .clone()
                .filter(|host| !host.is_empty()),
            connect_timeout: config::timeout_from_secs("connect timeout", self.connect_timeout)?,
            handshake_timeout: config::timeout_from_secs(
                "handshake timeout",
                self.handshake_timeout,
            )?,
            buffer_size: self.buffer_size,
        })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env first so clap's env defaults see it.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level);

    let config = args.proxy_config().context("Invalid proxy configuration")?;
    let oracle = DcapOracle::load(&args.dcap_library)
        .context("Failed to initialise quote verification")?;

    info!("Starting RA-TLS proxy");
    info!("  Listen: {}:{}", config.listen_host, config.listen_port);
    info!("  Upstream: {}:{}", config.upstream_host, config.upstream_port);
    info!("  Upstream connect host: {}", config.upstream_target());
    info!(
        "  Timeouts: connect {:?}, handshake {:?}",
        config.connect_timeout, config.handshake_timeout
    );
    info!("  DCAP library: {}", oracle.path().display());

    let proxy = RaTlsProxy::new(config, Arc::new(oracle)).context("Invalid proxy configuration")?;
    let listener = proxy.bind().await.context("Failed to bind listener")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping new connections");
            shutdown.cancel();
        }
    });

    proxy.serve(listener, shutdown).await?;
    Ok(())
}
