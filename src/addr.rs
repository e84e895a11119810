//! Address string parsing.
//!
//! Listener and connect addresses use the textual form
//! `[PROTO://][HOST]:PORT`, where `PROTO` is `tcp` or `udp` and
//! defaults to `tcp`. `HOST` may be a numeric IPv4 address, a
//! bracketed IPv6 address, a hostname, or empty (binding all
//! interfaces). A bare `:PORT` or `PORT` binds `0.0.0.0:PORT`.
//!
//! Hostnames are first looked up in the system hosts file; only when
//! that misses does the caller need an asynchronous DNS lookup.

use crate::error::Error;
use crate::sys::Transport;

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

/// Destination of a parsed address: either fully numeric, or a
/// hostname that still needs resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPort {
    /// A numeric socket address, ready to use.
    Addr(SocketAddr),

    /// A hostname and port requiring a DNS lookup.
    Name(String, u16),
}

/// Result of parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddr {
    pub transport: Transport,
    pub host: HostPort,
}

/// Parses an address string of the form `[PROTO://][HOST]:PORT`.
///
/// # Errors
///
/// Returns [`Error::Addr`] when the string matches none of the
/// supported forms or the port is out of range.
pub fn parse_address(address: &str) -> Result<ParsedAddr, Error> {
    parse_address_with_hosts(address, Path::new("/etc/hosts"))
}

pub(crate) fn parse_address_with_hosts(address: &str, hosts: &Path) -> Result<ParsedAddr, Error> {
    let bad = || Error::Addr(address.to_string());

    let (transport, rest) = if let Some(rest) = address.strip_prefix("tcp://") {
        (Transport::Tcp, rest)
    } else if let Some(rest) = address.strip_prefix("udp://") {
        (Transport::Udp, rest)
    } else {
        (Transport::Tcp, address)
    };

    if rest.is_empty() {
        return Err(bad());
    }

    // Numeric forms first: "1.2.3.4:80" and "[::1]:80".
    if let Ok(sa) = rest.parse::<SocketAddr>() {
        return Ok(ParsedAddr {
            transport,
            host: HostPort::Addr(sa),
        });
    }

    // Bare port, with or without a leading colon, binds all interfaces.
    let port_str = rest.strip_prefix(':').unwrap_or(rest);
    if let Ok(port) = port_str.parse::<u16>() {
        return Ok(ParsedAddr {
            transport,
            host: HostPort::Addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
        });
    }

    // "host:port" with a non-numeric host.
    let Some((host, port_str)) = rest.rsplit_once(':') else {
        return Err(bad());
    };
    let port: u16 = port_str.parse().map_err(|_| bad())?;

    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(bad());
    }

    if let Some(ip) = lookup_hosts_file(hosts, host) {
        return Ok(ParsedAddr {
            transport,
            host: HostPort::Addr(SocketAddr::from((ip, port))),
        });
    }

    Ok(ParsedAddr {
        transport,
        host: HostPort::Name(host.to_string(), port),
    })
}

/// Looks a hostname up in an `/etc/hosts`-style file.
///
/// Lines are `IP name [alias...]`; `#` starts a comment. Only IPv4
/// entries are considered.
fn lookup_hosts_file(path: &Path, name: &str) -> Option<Ipv4Addr> {
    let contents = fs::read_to_string(path).ok()?;

    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();

        let Some(ip) = fields.next().and_then(|f| f.parse::<Ipv4Addr>().ok()) else {
            continue;
        };

        if fields.any(|alias| alias.eq_ignore_ascii_case(name)) {
            return Some(ip);
        }
    }

    None
}
