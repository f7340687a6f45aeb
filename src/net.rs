use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr};

/// Resolve `host` to its first IPv4 address.
pub async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let addrs = smol::net::resolve((host, 0)).await?;
    addrs
        .into_iter()
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::ConfigInvalid(vec![format!("{} has no IPv4 address", host)]))
}
