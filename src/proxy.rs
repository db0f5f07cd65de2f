//! Listener and accept loop.
//!
//! Each accepted client gets its own task running the [`Gate`]. Shutdown stops
//! accepting first, then cancels in-flight sessions and waits for them.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::oracle::AttestationOracle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

const LISTEN_BACKLOG: u32 = 1024;

/// RA-TLS gating proxy.
#[derive(Clone)]
pub struct RaTlsProxy {
    gate: Arc<Gate>,
}

impl RaTlsProxy {
    /// Validate the configuration and build the shared gate. Fails only with
    /// configuration errors.
    pub fn new(config: ProxyConfig, oracle: Arc<dyn AttestationOracle>) -> Result<Self> {
        let gate = Gate::new(Arc::new(config), oracle)?;
        Ok(Self {
            gate: Arc::new(gate),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        self.gate.config()
    }

    /// Bind the listening socket on the configured host and port.
    pub async fn bind(&self) -> Result<TcpListener> {
        let config = self.gate.config();
        let addr = lookup_host((config.listen_host.as_str(), config.listen_port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "listen host '{}' resolved to no addresses",
                    config.listen_host
                ))
            })?;

        bind_reusable(addr)
    }

    /// Accept clients until `shutdown` is cancelled, then drain sessions.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Proxy listening on {}", addr);
        }

        let sessions = TaskTracker::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let gate = self.gate.clone();
                    let shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        gate.handle(stream, peer, shutdown).await;
                    });
                }
            }
        }

        drop(listener);
        sessions.close();
        if !sessions.is_empty() {
            info!("Waiting for {} active connections to finish", sessions.len());
        }
        sessions.wait().await;
        info!("Proxy stopped");

        Ok(())
    }

    /// Bind and serve.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }
}

fn bind_reusable(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

/// Run a proxy with the given configuration and oracle until `shutdown` fires.
pub async fn run_server(
    config: ProxyConfig,
    oracle: Arc<dyn AttestationOracle>,
    shutdown: CancellationToken,
) -> Result<()> {
    RaTlsProxy::new(config, oracle)?.run(shutdown).await
}
