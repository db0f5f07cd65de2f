//! Host name resolution for deployments that pin `--upstream-connect-host`.

use crate::error::{Error, Result};
use std::net::IpAddr;
use tokio::net::lookup_host;

/// Resolve `host` to one address, preferring IPv4 when available.
pub async fn resolve_host(host: &str) -> Result<IpAddr> {
    let addresses: Vec<IpAddr> = lookup_host((host, 0))
        .await
        .map_err(|e| Error::Configuration(format!("unable to resolve '{host}': {e}")))?
        .map(|addr| addr.ip())
        .collect();

    addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| Error::Configuration(format!("no addresses resolved for '{host}'")))
}
