//! Proxy configuration.

use crate::error::{Error, Result};
use std::time::Duration;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 8443;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Runtime configuration, read-only once the proxy starts.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Host used as the TLS server name for the attestation probe.
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Concrete host/IP for upstream TCP sockets, if different from `upstream_host`.
    pub upstream_connect_host: Option<String>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 443,
            upstream_connect_host: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ProxyConfig {
    /// The host that upstream TCP sockets actually connect to.
    pub fn upstream_target(&self) -> &str {
        self.upstream_connect_host
            .as_deref()
            .unwrap_or(&self.upstream_host)
    }

    /// Upper bound for the whole probe (connect + handshake).
    pub fn probe_deadline(&self) -> Duration {
        self.connect_timeout + self.handshake_timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::Configuration("listen host must not be empty".into()));
        }
        if self.upstream_host.is_empty() {
            return Err(Error::Configuration("upstream host must not be empty".into()));
        }
        if self.upstream_port == 0 {
            return Err(Error::Configuration("upstream port must not be 0".into()));
        }
        if matches!(self.upstream_connect_host.as_deref(), Some("")) {
            return Err(Error::Configuration(
                "upstream connect host must not be empty when set".into(),
            ));
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::Configuration("timeouts must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Configuration("buffer size must be positive".into()));
        }
        Ok(())
    }
}

/// Split a `host:port` target. Bracketed IPv6 literals (`[::1]:443`) are accepted.
pub fn parse_upstream(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| Error::Configuration(format!("'{target}' must be in host:port format")))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() || port.is_empty() {
        return Err(Error::Configuration(format!(
            "'{target}' must be in host:port format"
        )));
    }

    let port = port
        .parse::<u16>()
        .map_err(|e| Error::Configuration(format!("invalid port in '{target}': {e}")))?;

    Ok((host.to_string(), port))
}

/// Convert a timeout given in (possibly fractional) seconds.
pub fn timeout_from_secs(name: &str, secs: f64) -> Result<Duration> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(Error::Configuration(format!(
            "{name} must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Configuration(format!("{name} out of range: {e}")))
}
