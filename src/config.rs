//! Endpoint configuration.

/// Configuration shared by TCP/TLS servers, clients and their sessions.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Enable OS TCP keep-alive on connected sockets
    pub keep_alive: bool,
    /// Disable Nagle's algorithm on connected sockets
    pub no_delay: bool,
    /// Set SO_REUSEADDR on the listener
    pub reuse_address: bool,
    /// Set SO_REUSEPORT on the listener (unix only)
    pub reuse_port: bool,
    /// Accept both IPv4 and IPv6 on an IPv6 listener
    pub dual_mode: bool,
    /// Listen queue depth
    pub accept_backlog: u32,
    /// Initial per-session receive buffer capacity, also applied as the
    /// SO_RCVBUF hint
    pub receive_buffer_size: usize,
    /// Initial per-session send buffer capacity, also applied as the
    /// SO_SNDBUF hint
    pub send_buffer_size: usize,
    /// Cap for receive buffer growth; the buffer doubles on exact fill up to
    /// this limit
    pub max_receive_buffer_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            keep_alive: false,
            no_delay: false,
            reuse_address: false,
            reuse_port: false,
            dual_mode: false,
            accept_backlog: 1024,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            max_receive_buffer_size: 32 * 1024 * 1024, // 32 MiB
        }
    }
}

/// Configuration for datagram endpoints.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Set SO_REUSEADDR before binding (required for shared multicast ports)
    pub reuse_address: bool,
    /// Set SO_REUSEPORT before binding (unix only)
    pub reuse_port: bool,
    /// Whether this endpoint participates in a multicast group
    pub multicast: bool,
    /// Time-to-live for outgoing multicast datagrams
    pub multicast_ttl: u32,
    /// Deliver own multicast datagrams to local group members
    pub multicast_loopback: bool,
    /// Initial receive buffer capacity, also applied as the SO_RCVBUF hint
    pub receive_buffer_size: usize,
    /// Send buffer size applied as the SO_SNDBUF hint
    pub send_buffer_size: usize,
    /// Cap for receive buffer growth
    pub max_receive_buffer_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            reuse_address: false,
            reuse_port: false,
            multicast: false,
            multicast_ttl: 1,
            multicast_loopback: true,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            max_receive_buffer_size: 32 * 1024 * 1024, // 32 MiB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let tcp = TcpConfig::default();
        assert_eq!(tcp.accept_backlog, 1024);
        assert_eq!(tcp.receive_buffer_size, 8192);
        assert!(tcp.max_receive_buffer_size >= tcp.receive_buffer_size);

        let udp = UdpConfig::default();
        assert_eq!(udp.multicast_ttl, 1);
        assert!(udp.multicast_loopback);
        assert!(!udp.multicast);
    }
}
