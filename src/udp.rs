//! Datagram endpoint: a single UDP socket with single-shot send and receive
//! and multicast group membership.
//!
//! Unlike stream sessions there is no continuous pump: the caller arms one
//! `recv_from` with [`UdpEndpoint::receive`] and re-arms it from
//! `on_received`/`on_sent` as fits the protocol. At most one receive and one
//! send are outstanding at any time, so the hot path needs no lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::ByteBuffer;
use crate::config::UdpConfig;
use crate::endpoint::MulticastGroup;
use crate::error::{Result, TransportError};
use crate::handler::DatagramHandler;

/// Aggregate datagram endpoint counters.
#[derive(Debug, Clone)]
pub struct UdpStats {
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Datagrams handed to the socket
    pub datagrams_sent: u64,
    /// Datagrams delivered to the handler
    pub datagrams_received: u64,
}

#[derive(Debug, Clone, Copy)]
enum BindTarget {
    Addr(SocketAddr),
    Group(MulticastGroup),
}

struct UdpInner {
    config: UdpConfig,
    handler: Arc<dyn DatagramHandler>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    started: AtomicBool,
    multicast: AtomicBool,
    receiving: AtomicBool,
    sending: AtomicBool,
    group: Mutex<Option<MulticastGroup>>,
    bind_target: Mutex<Option<BindTarget>>,
    local_addr: Mutex<Option<SocketAddr>>,
    recv_capacity: AtomicUsize,
    stop_signal: watch::Sender<bool>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
}

/// One datagram socket usable as a UDP server, client or multicast member.
#[derive(Clone)]
pub struct UdpEndpoint {
    inner: Arc<UdpInner>,
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UdpEndpoint{{addr:{:?}}}",
            *self.inner.local_addr.lock().expect("udp lock poisoned")
        )
    }
}

impl UdpEndpoint {
    /// Create an endpoint from its configuration and handler.
    pub fn new(config: UdpConfig, handler: Arc<dyn DatagramHandler>) -> Self {
        let (stop_signal, _) = watch::channel(false);
        let multicast = config.multicast;
        Self {
            inner: Arc::new(UdpInner {
                config,
                handler,
                socket: Mutex::new(None),
                started: AtomicBool::new(false),
                multicast: AtomicBool::new(multicast),
                receiving: AtomicBool::new(false),
                sending: AtomicBool::new(false),
                group: Mutex::new(None),
                bind_target: Mutex::new(None),
                local_addr: Mutex::new(None),
                recv_capacity: AtomicUsize::new(0),
                stop_signal,
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                datagrams_sent: AtomicU64::new(0),
                datagrams_received: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the socket to `addr`.
    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        self.start_inner(BindTarget::Addr(addr)).await
    }

    /// Bind to the group's port, enable multicast options and join `group`.
    pub async fn start_multicast(&self, group: MulticastGroup) -> Result<()> {
        self.start_inner(BindTarget::Group(group)).await
    }

    async fn start_inner(&self, target: BindTarget) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        match self.bind_and_join(target).await {
            Ok(()) => {
                inner.stop_signal.send_replace(false);
                inner
                    .recv_capacity
                    .store(inner.config.receive_buffer_size.max(64), Ordering::Relaxed);
                info!(addr = ?self.address(), "udp endpoint started");
                inner.handler.on_started(self).await;
                Ok(())
            }
            Err(e) => {
                *inner.socket.lock().expect("udp lock poisoned") = None;
                inner.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn bind_and_join(&self, target: BindTarget) -> Result<()> {
        let inner = &self.inner;
        let (bind_addr, group) = match target {
            BindTarget::Addr(addr) => (addr, None),
            BindTarget::Group(group) => (group.bind_addr(), Some(group)),
        };

        // Group members share their port, so the reuse options go on before
        // the bind.
        let want_reuse =
            inner.config.reuse_address || inner.config.reuse_port || group.is_some();
        let socket;
        if want_reuse {
            #[cfg(unix)]
            {
                let std_socket =
                    crate::sockopt::bind_udp_reuse(bind_addr, inner.config.reuse_port)?;
                socket = UdpSocket::from_std(std_socket)?;
            }
            #[cfg(not(unix))]
            {
                socket = UdpSocket::bind(bind_addr).await?;
            }
        } else {
            socket = UdpSocket::bind(bind_addr).await?;
        }

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            let _ = crate::sockopt::set_buffer_hints(
                socket.as_raw_fd(),
                inner.config.receive_buffer_size,
                inner.config.send_buffer_size,
            );
        }

        if let Some(group) = group {
            inner.multicast.store(true, Ordering::Release);
            Self::apply_multicast_options(&inner.config, &socket, group.group)?;
            Self::join(&socket, &group)?;
            info!(group = %group.socket_addr(), "joined multicast group");
        }

        let local = socket.local_addr()?;
        *inner.socket.lock().expect("udp lock poisoned") = Some(Arc::new(socket));
        *inner.local_addr.lock().expect("udp lock poisoned") = Some(local);
        *inner.group.lock().expect("udp lock poisoned") = group;
        *inner.bind_target.lock().expect("udp lock poisoned") = Some(target);
        Ok(())
    }

    fn apply_multicast_options(config: &UdpConfig, socket: &UdpSocket, family: IpAddr) -> Result<()> {
        match family {
            IpAddr::V4(_) => {
                socket.set_multicast_ttl_v4(config.multicast_ttl)?;
                socket.set_multicast_loop_v4(config.multicast_loopback)?;
            }
            IpAddr::V6(_) => {
                socket.set_multicast_loop_v6(config.multicast_loopback)?;
            }
        }
        Ok(())
    }

    fn join(socket: &UdpSocket, group: &MulticastGroup) -> Result<()> {
        match group.group {
            IpAddr::V4(v4) => socket.join_multicast_v4(v4, std::net::Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(v6) => socket.join_multicast_v6(&v6, 0)?,
        }
        Ok(())
    }

    /// Close the socket. Outstanding operations observe the stop and become
    /// no-ops.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.started.swap(false, Ordering::AcqRel) {
            return Err(TransportError::NotStarted);
        }
        inner.stop_signal.send_replace(true);

        let socket = inner.socket.lock().expect("udp lock poisoned").take();
        let group = inner.group.lock().expect("udp lock poisoned").take();
        if let (Some(socket), Some(group)) = (socket.as_ref(), group) {
            if let Err(e) = Self::leave(socket, &group) {
                debug!(error = %e, "leave on stop failed");
            }
        }
        *inner.local_addr.lock().expect("udp lock poisoned") = None;
        info!("udp endpoint stopped");
        inner.handler.on_stopped(self).await;
        Ok(())
    }

    /// Stop and start again with the original bind target.
    pub async fn restart(&self) -> Result<()> {
        let target = self
            .inner
            .bind_target
            .lock()
            .expect("udp lock poisoned")
            .ok_or(TransportError::NotStarted)?;
        self.stop().await?;
        self.start_inner(target).await?;
        self.inner.handler.on_restarted(self).await;
        Ok(())
    }

    fn leave(socket: &UdpSocket, group: &MulticastGroup) -> Result<()> {
        match group.group {
            IpAddr::V4(v4) => socket.leave_multicast_v4(v4, std::net::Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(v6) => socket.leave_multicast_v6(&v6, 0)?,
        }
        Ok(())
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.inner.socket.lock().expect("udp lock poisoned").clone()
    }

    /// Arm a single `recv_from`. Returns false when the endpoint is stopped
    /// or a receive is already outstanding; completion fires `on_received`.
    pub fn receive(&self) -> bool {
        let inner = &self.inner;
        if !inner.started.load(Ordering::Acquire) {
            return false;
        }
        let Some(socket) = self.socket() else {
            return false;
        };
        if inner.receiving.swap(true, Ordering::AcqRel) {
            return false;
        }

        let endpoint = self.clone();
        let mut stop = inner.stop_signal.subscribe();
        tokio::spawn(async move {
            let inner = &endpoint.inner;
            if *stop.borrow() {
                inner.receiving.store(false, Ordering::Release);
                return;
            }
            let capacity = inner.recv_capacity.load(Ordering::Relaxed);
            let mut buf = ByteBuffer::with_capacity(capacity);
            buf.resize(capacity);

            let received = tokio::select! {
                r = socket.recv_from(buf.as_mut_slice()) => r,
                _ = stop.changed() => {
                    inner.receiving.store(false, Ordering::Release);
                    return;
                }
            };
            inner.receiving.store(false, Ordering::Release);

            match received {
                Ok((n, peer)) => {
                    inner.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    inner.datagrams_received.fetch_add(1, Ordering::Relaxed);
                    inner
                        .handler
                        .on_received(&endpoint, peer, &buf.as_slice()[..n])
                        .await;
                    // A datagram that filled the buffer was probably
                    // truncated; double for the next arm.
                    let limit = inner.config.max_receive_buffer_size.max(capacity);
                    if n == capacity && capacity < limit {
                        inner
                            .recv_capacity
                            .store((capacity * 2).min(limit), Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    let err = TransportError::from(e);
                    if !err.is_expected_disconnect() {
                        warn!(error = %err, "udp receive failed");
                        inner.handler.on_error(&endpoint, &err).await;
                    }
                }
            }
        });
        true
    }

    /// Arm a single `send_to` of `data` towards `endpoint`. Returns false
    /// when stopped or a send is already outstanding; completion fires
    /// `on_sent`.
    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> bool {
        let inner = &self.inner;
        if !inner.started.load(Ordering::Acquire) {
            return false;
        }
        let Some(socket) = self.socket() else {
            return false;
        };
        if inner.sending.swap(true, Ordering::AcqRel) {
            return false;
        }

        let endpoint = self.clone();
        let payload = data.to_vec();
        let mut stop = inner.stop_signal.subscribe();
        tokio::spawn(async move {
            let inner = &endpoint.inner;
            if *stop.borrow() {
                inner.sending.store(false, Ordering::Release);
                return;
            }
            let sent = tokio::select! {
                r = socket.send_to(&payload, peer) => r,
                _ = stop.changed() => {
                    inner.sending.store(false, Ordering::Release);
                    return;
                }
            };
            inner.sending.store(false, Ordering::Release);

            match sent {
                Ok(n) => {
                    inner.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    inner.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    inner.handler.on_sent(&endpoint, peer, n).await;
                }
                Err(e) => {
                    let err = TransportError::from(e);
                    if !err.is_expected_disconnect() {
                        warn!(peer = %peer, error = %err, "udp send failed");
                        inner.handler.on_error(&endpoint, &err).await;
                    }
                }
            }
        });
        true
    }

    /// Send a text payload asynchronously.
    pub fn send_text_to(&self, peer: SocketAddr, text: &str) -> bool {
        self.send_to(peer, text.as_bytes())
    }

    /// Send directly in the caller's context, propagating errors.
    ///
    /// Rejected with [`TransportError::SendPending`] while an asynchronous
    /// send is outstanding, preserving the one-send-in-flight discipline.
    pub async fn send_sync(&self, peer: SocketAddr, data: &[u8]) -> Result<usize> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::Acquire) {
            return Err(TransportError::NotStarted);
        }
        let socket = self.socket().ok_or(TransportError::NotStarted)?;
        if inner.sending.swap(true, Ordering::AcqRel) {
            return Err(TransportError::SendPending);
        }
        let result = socket.send_to(data, peer).await;
        inner.sending.store(false, Ordering::Release);
        match result {
            Ok(n) => {
                inner.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                inner.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `data` to the configured multicast group.
    pub fn multicast(&self, data: &[u8]) -> bool {
        match *self.inner.group.lock().expect("udp lock poisoned") {
            Some(group) => self.send_to(group.socket_addr(), data),
            None => false,
        }
    }

    /// Send `data` to the configured multicast group in the caller's context.
    pub async fn multicast_sync(&self, data: &[u8]) -> Result<usize> {
        let group = self
            .inner
            .group
            .lock()
            .expect("udp lock poisoned")
            .ok_or_else(|| TransportError::InvalidAddress("no multicast group".into()))?;
        self.send_sync(group.socket_addr(), data).await
    }

    /// Join `group` on the bound socket and remember it as the send target
    /// for [`multicast`](Self::multicast).
    pub fn join_multicast_group(&self, group: MulticastGroup) -> Result<()> {
        let socket = self.socket().ok_or(TransportError::NotStarted)?;
        Self::join(&socket, &group)?;
        *self.inner.group.lock().expect("udp lock poisoned") = Some(group);
        debug!(group = %group.socket_addr(), "joined multicast group");
        Ok(())
    }

    /// Leave `group` on the bound socket.
    pub fn leave_multicast_group(&self, group: MulticastGroup) -> Result<()> {
        let socket = self.socket().ok_or(TransportError::NotStarted)?;
        Self::leave(&socket, &group)?;
        let mut current = self.inner.group.lock().expect("udp lock poisoned");
        if *current == Some(group) {
            *current = None;
        }
        debug!(group = %group.socket_addr(), "left multicast group");
        Ok(())
    }

    /// Toggle multicast sending options (TTL, loopback) on the bound socket.
    pub fn setup_multicast(&self, enable: bool) -> Result<()> {
        let inner = &self.inner;
        let socket = self.socket().ok_or(TransportError::NotStarted)?;
        inner.multicast.store(enable, Ordering::Release);
        if enable {
            let family = self
                .address()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
            Self::apply_multicast_options(&inner.config, &socket, family)?;
        }
        Ok(())
    }

    /// Whether the socket is bound.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Whether multicast options are enabled.
    pub fn is_multicast(&self) -> bool {
        self.inner.multicast.load(Ordering::Acquire)
    }

    /// Local socket address while started.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("udp lock poisoned")
    }

    /// The group this endpoint sends to with `multicast`, if any.
    pub fn multicast_group(&self) -> Option<MulticastGroup> {
        *self.inner.group.lock().expect("udp lock poisoned")
    }

    /// Total payload bytes sent.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total payload bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Counters snapshot.
    pub fn stats(&self) -> UdpStats {
        let inner = &self.inner;
        UdpStats {
            bytes_sent: inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: inner.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: inner.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: inner.datagrams_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct EchoUdp;

    #[async_trait]
    impl DatagramHandler for EchoUdp {
        async fn on_received(&self, endpoint: &UdpEndpoint, peer: SocketAddr, data: &[u8]) {
            endpoint.send_to(peer, data);
        }

        async fn on_sent(&self, endpoint: &UdpEndpoint, _peer: SocketAddr, _sent: usize) {
            endpoint.receive();
        }
    }

    struct Collector {
        tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    }

    #[async_trait]
    impl DatagramHandler for Collector {
        async fn on_received(&self, endpoint: &UdpEndpoint, peer: SocketAddr, data: &[u8]) {
            self.tx.send((peer, data.to_vec())).ok();
            endpoint.receive();
        }
    }

    #[tokio::test]
    async fn test_udp_echo() {
        let server = UdpEndpoint::new(UdpConfig::default(), Arc::new(EchoUdp));
        server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.address().unwrap();
        assert!(server.receive());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = UdpEndpoint::new(UdpConfig::default(), Arc::new(Collector { tx }));
        client.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(client.receive());

        let sent = client.send_sync(server_addr, b"abc").await.unwrap();
        assert_eq!(sent, 3);

        let (peer, reply) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"abc");
        assert_eq!(peer, server_addr);

        assert_eq!(server.stats().datagrams_received, 1);
        assert_eq!(server.stats().datagrams_sent, 1);
        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_multicast_group_delivery() {
        // Pick a free port for the group by probing with an ephemeral bind.
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let group = MulticastGroup::new("239.255.0.1".parse().unwrap(), port).unwrap();

        let mut receivers = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..2 {
            let (tx, rx) = mpsc::unbounded_channel();
            let member = UdpEndpoint::new(UdpConfig::default(), Arc::new(Collector { tx }));
            if let Err(e) = member.start_multicast(group).await {
                eprintln!("skipping multicast test, no group support here: {e}");
                return;
            }
            assert!(member.receive());
            receivers.push(member);
            channels.push(rx);
        }

        let sender = UdpEndpoint::new(UdpConfig::default(), Arc::new(EchoUdp));
        sender.start("0.0.0.0:0".parse().unwrap()).await.unwrap();
        if let Err(e) = sender
            .join_multicast_group(group)
            .and_then(|_| sender.setup_multicast(true))
        {
            eprintln!("skipping multicast test, no group support here: {e}");
            return;
        }

        match sender.multicast_sync(b"tick").await {
            Ok(n) => assert_eq!(n, 4),
            Err(e) => {
                eprintln!("skipping multicast test, send not routable here: {e}");
                return;
            }
        }

        for rx in &mut channels {
            let (_, payload) = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("group member saw no datagram")
                .unwrap();
            assert_eq!(payload, b"tick");
        }

        for member in &receivers {
            member.stop().await.unwrap();
        }
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = UdpEndpoint::new(UdpConfig::default(), Arc::new(Collector { tx }));

        assert!(!endpoint.receive());
        assert!(!endpoint.send_to("127.0.0.1:9999".parse().unwrap(), b"x"));
        let err = endpoint.send_sync("127.0.0.1:9999".parse().unwrap(), b"x").await;
        assert!(matches!(err, Err(TransportError::NotStarted)));
        assert!(endpoint.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_restart_rebinds() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = UdpEndpoint::new(UdpConfig::default(), Arc::new(Collector { tx }));
        endpoint.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(endpoint.is_started());

        endpoint.restart().await.unwrap();
        assert!(endpoint.is_started());
        assert!(endpoint.address().is_some());
        endpoint.stop().await.unwrap();
        assert!(!endpoint.is_started());
    }

    #[tokio::test]
    async fn test_single_receive_outstanding() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = UdpEndpoint::new(UdpConfig::default(), Arc::new(Collector { tx }));
        endpoint.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert!(endpoint.receive());
        // Second arm is refused while the first is outstanding.
        assert!(!endpoint.receive());
        endpoint.stop().await.unwrap();
    }
}
