//! Endpoint addressing: bind/connect targets and multicast groups.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Result, TransportError};

/// Resolve `host:port` to the first matching socket address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::InvalidAddress(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(format!("{host}:{port}: no addresses")))
}

/// A multicast group address: group IP plus UDP port.
///
/// Distinct from the server-side "multicast to all sessions" operation; this
/// is the network-layer group a datagram endpoint joins and sends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastGroup {
    /// The group address (224.0.0.0/4 or ff00::/8).
    pub group: IpAddr,
    /// The UDP port shared by all group members.
    pub port: u16,
}

impl MulticastGroup {
    /// Create a group, rejecting addresses outside the multicast ranges.
    pub fn new(group: IpAddr, port: u16) -> Result<Self> {
        if !group.is_multicast() {
            return Err(TransportError::InvalidAddress(format!(
                "{group} is not a multicast address"
            )));
        }
        Ok(Self { group, port })
    }

    /// The group as a send target.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group, self.port)
    }

    /// The wildcard address members bind to before joining the group.
    pub fn bind_addr(&self) -> SocketAddr {
        match self.group {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), self.port),
        }
    }
}
