/**
 * nat_traversal/address.rs
 *
 * "ip:port" parsing for raw bind/connect calls (IPv4 only)
 */

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Endpoint parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid ip:port format: {0:?}")]
    InvalidFormat(String),

    #[error("invalid IP address: {0:?}")]
    InvalidAddress(String),

    #[error("not an IPv4 address: {0:?}")]
    NotIpv4(String),

    #[error("invalid port number: {0:?}")]
    InvalidPort(String),
}

/// Parse an "ip:port" string into an IPv4 socket address.
///
/// The string is split on the last `:`. A bracketed host (`[..]:port`) is
/// accepted so IPv4-mapped IPv6 literals resolve to their IPv4 form; any
/// other IPv6 host is rejected with [`AddressError::NotIpv4`].
pub fn parse_endpoint(s: &str) -> Result<SocketAddrV4, AddressError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AddressError::InvalidFormat(s.to_string()))?;

    if host.is_empty() {
        return Err(AddressError::InvalidFormat(s.to_string()));
    }

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let ip: IpAddr = host
        .parse()
        .map_err(|_| AddressError::InvalidAddress(host.to_string()))?;

    let ip = to_ipv4(ip).ok_or_else(|| AddressError::NotIpv4(host.to_string()))?;

    // Only plain decimal digits, no sign
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidPort(port.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| AddressError::InvalidPort(port.to_string()))?;

    Ok(SocketAddrV4::new(ip, port))
}

fn to_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
