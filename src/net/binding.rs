//! Local-binding resolution and outbound TCP setup.
//!
//! # Responsibilities
//! - Map an interface name or literal IP onto a source address
//! - Connect TCP sockets from that source within a dial timeout
//! - Apply keepalive/nodelay to TLS-family sockets

use std::future::Future;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{Result, TransportError};

/// Keepalive period for accepted and dialed TLS sockets.
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(15);

struct InterfaceEntry {
    name: String,
    up: bool,
    ip: Option<IpAddr>,
}

fn interfaces() -> Result<Vec<InterfaceEntry>> {
    let addrs = getifaddrs().map_err(|e| TransportError::Io(e.into()))?;
    Ok(addrs
        .map(|ifa| {
            let ip = ifa.address.as_ref().and_then(|storage| {
                if let Some(v4) = storage.as_sockaddr_in() {
                    Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()))
                } else {
                    storage
                        .as_sockaddr_in6()
                        .map(|v6| IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
                }
            });
            InterfaceEntry {
                name: ifa.interface_name,
                up: ifa.flags.contains(InterfaceFlags::IFF_UP),
                ip,
            }
        })
        .collect())
}

/// Resolve `binding` to a source IP.
///
/// `""` and `"default"` mean "let the OS choose". A literal IP must belong to
/// an interface that is up; anything else is treated as an interface name and
/// resolves to that interface's first address.
pub fn resolve_local_binding(binding: &str) -> Result<Option<IpAddr>> {
    if binding.is_empty() || binding == "default" {
        return Ok(None);
    }
    resolve_in(binding, &interfaces()?).map(Some)
}

fn resolve_in(binding: &str, entries: &[InterfaceEntry]) -> Result<IpAddr> {
    let fail = |reason: &str| TransportError::Binding {
        binding: binding.to_string(),
        reason: reason.to_string(),
    };

    if let Ok(ip) = binding.parse::<IpAddr>() {
        return entries
            .iter()
            .find(|e| e.up && e.ip == Some(ip))
            .map(|_| ip)
            .ok_or_else(|| fail("no up interface has this address"));
    }

    let named: Vec<&InterfaceEntry> = entries.iter().filter(|e| e.name == binding).collect();
    if named.is_empty() {
        return Err(fail("no such interface"));
    }
    if !named.iter().any(|e| e.up) {
        return Err(fail("interface is down"));
    }

    named
        .iter()
        .filter(|e| e.up)
        .find_map(|e| e.ip)
        .ok_or_else(|| fail("interface has no addresses"))
}

/// Run `fut` under `timeout`; a zero timeout means wait indefinitely.
pub async fn with_timeout<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout { operation, timeout })?
}

/// Connect to `host_port`, optionally from `local`.
///
/// Candidates of the wrong family for `local` are skipped; the last
/// connection error is returned if none succeed.
pub async fn connect_tcp(host_port: &str, local: Option<IpAddr>) -> Result<TcpStream> {
    let mut last_err = None;

    for addr in tokio::net::lookup_host(host_port).await? {
        if let Some(ip) = local {
            if ip.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }
        match connect_one(addr, local).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) => TransportError::Io(e),
        None => TransportError::Binding {
            binding: local.map(|ip| ip.to_string()).unwrap_or_default(),
            reason: format!("no usable address for {host_port}"),
        },
    })
}

async fn connect_one(addr: SocketAddr, local: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = local {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    socket.connect(addr).await
}

/// TCP_NODELAY plus a 15 s keepalive.
pub fn tune_tcp_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE))
}
