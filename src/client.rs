//! TCP and TLS clients: outbound connect plus the shared session engine.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::TcpConfig;
use crate::error::{Result, TransportError};
use crate::handler::SessionHandler;
use crate::session::{Session, TlsRole};
use crate::tls::TlsClientContext;

struct ClientCore {
    config: TcpConfig,
    handler: Arc<dyn SessionHandler>,
    tls: Option<TlsClientContext>,
    session: Mutex<Option<Arc<Session>>>,
    driver: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    target: Mutex<Option<SocketAddr>>,
}

impl ClientCore {
    fn new(
        config: TcpConfig,
        handler: Arc<dyn SessionHandler>,
        tls: Option<TlsClientContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            tls,
            session: Mutex::new(None),
            driver: AsyncMutex::new(None),
            target: Mutex::new(None),
        })
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().expect("client lock poisoned").clone()
    }

    async fn connect(core: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        if core
            .current()
            .map(|s| s.is_connected())
            .unwrap_or(false)
        {
            return Err(TransportError::AlreadyStarted);
        }

        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }?;
        if core.config.receive_buffer_size > 0 {
            socket.set_recv_buffer_size(core.config.receive_buffer_size as u32)?;
        }
        if core.config.send_buffer_size > 0 {
            socket.set_send_buffer_size(core.config.send_buffer_size as u32)?;
        }
        let stream = socket.connect(addr).await.map_err(TransportError::from)?;
        if core.config.no_delay {
            let _ = stream.set_nodelay(true);
        }
        #[cfg(unix)]
        if core.config.keep_alive {
            use std::os::fd::AsRawFd;
            if let Err(e) = crate::sockopt::set_keep_alive(stream.as_raw_fd(), true) {
                debug!(error = %e, "keep-alive not applied");
            }
        }
        let local = stream.local_addr()?;

        let session = Session::new(
            addr,
            local,
            core.config.clone(),
            core.handler.clone(),
            None,
            core.tls.is_some(),
        );
        *core.session.lock().expect("client lock poisoned") = Some(session.clone());
        *core.target.lock().expect("client lock poisoned") = Some(addr);

        let role = match &core.tls {
            Some(ctx) => TlsRole::Client(ctx.clone()),
            None => TlsRole::None,
        };
        let task = tokio::spawn(session.drive(stream, role));
        *core.driver.lock().await = Some(task);
        info!(peer = %addr, tls = core.tls.is_some(), "client connected");
        Ok(())
    }

    async fn disconnect(core: &Arc<Self>) -> bool {
        let session = core.session.lock().expect("client lock poisoned").take();
        let Some(session) = session else {
            return false;
        };
        let was_connected = session.disconnect();
        if let Some(task) = core.driver.lock().await.take() {
            let _ = task.await;
        }
        debug!(peer = %session.peer_addr(), "client disconnected");
        was_connected
    }

    async fn reconnect(core: &Arc<Self>) -> Result<()> {
        let target = core
            .target
            .lock()
            .expect("client lock poisoned")
            .ok_or(TransportError::NotConnected)?;
        Self::disconnect(core).await;
        Self::connect(core, target).await
    }
}

macro_rules! delegate_client_api {
    () => {
        /// Connect to `addr` and run the session until disconnect.
        ///
        /// Resolves once the TCP connection is established; the TLS
        /// handshake (if any) completes on the session driver and is
        /// signalled through `on_handshaked`.
        pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
            ClientCore::connect(&self.core, addr).await
        }

        /// Initiate a connect on a background task. Failures are logged, not
        /// returned.
        pub fn connect_async(&self, addr: SocketAddr) -> bool {
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = ClientCore::connect(&core, addr).await {
                    warn!(peer = %addr, error = %e, "async connect failed");
                }
            });
            true
        }

        /// Disconnect and wait for the session teardown to finish.
        /// Returns true if the client was connected.
        pub async fn disconnect(&self) -> bool {
            ClientCore::disconnect(&self.core).await
        }

        /// Initiate a disconnect on a background task.
        pub fn disconnect_async(&self) -> bool {
            let core = self.core.clone();
            tokio::spawn(async move {
                ClientCore::disconnect(&core).await;
            });
            true
        }

        /// Disconnect, then connect again to the last target.
        pub async fn reconnect(&self) -> Result<()> {
            ClientCore::reconnect(&self.core).await
        }

        /// Initiate a reconnect on a background task.
        pub fn reconnect_async(&self) -> bool {
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = ClientCore::reconnect(&core).await {
                    warn!(error = %e, "async reconnect failed");
                }
            });
            true
        }

        /// Queue bytes for asynchronous transmission on the current session.
        pub fn send(&self, data: &[u8]) -> bool {
            self.core
                .current()
                .map(|s| s.send(data))
                .unwrap_or(false)
        }

        /// Queue a text payload for asynchronous transmission.
        pub fn send_text(&self, text: &str) -> bool {
            self.send(text.as_bytes())
        }

        /// Send and wait until the bytes reach the socket.
        pub async fn send_sync(&self, data: &[u8]) -> Result<u64> {
            match self.core.current() {
                Some(session) => session.send_sync(data).await,
                None => Err(TransportError::NotConnected),
            }
        }

        /// The live session, if connected.
        pub fn session(&self) -> Option<Arc<Session>> {
            self.core.current()
        }

        /// Whether the current session is connected.
        pub fn is_connected(&self) -> bool {
            self.core
                .current()
                .map(|s| s.is_connected())
                .unwrap_or(false)
        }

        /// Whether the current session finished its TLS handshake.
        pub fn is_handshaked(&self) -> bool {
            self.core
                .current()
                .map(|s| s.is_handshaked())
                .unwrap_or(false)
        }
    };
}

/// Asynchronous TCP client.
///
/// Owns socket creation and connect; receive and send then follow the same
/// session discipline as server-side sessions. After a disconnect the client
/// can be reconnected, optionally with a caller-chosen back-off delay.
#[derive(Clone)]
pub struct TcpClient {
    core: Arc<ClientCore>,
}

impl TcpClient {
    /// Create a client from its configuration and handler.
    pub fn new(config: TcpConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            core: ClientCore::new(config, handler, None),
        }
    }

    delegate_client_api!();
}

/// Asynchronous TLS client: a [`TcpClient`] that handshakes with a prepared
/// TLS configuration before exchanging application data.
#[derive(Clone)]
pub struct TlsClient {
    core: Arc<ClientCore>,
}

impl TlsClient {
    /// Create a client from its configuration, handler and TLS context.
    pub fn new(config: TcpConfig, handler: Arc<dyn SessionHandler>, tls: TlsClientContext) -> Self {
        Self {
            core: ClientCore::new(config, handler, Some(tls)),
        }
    }

    delegate_client_api!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServerHandler;
    use crate::server::TcpServer;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct EchoSession;

    #[async_trait]
    impl SessionHandler for EchoSession {
        async fn on_received(&self, session: &Arc<Session>, data: &[u8]) {
            session.send(data);
        }
    }

    struct EchoServer;

    #[async_trait]
    impl ServerHandler for EchoServer {
        fn create_session(&self) -> Arc<dyn SessionHandler> {
            Arc::new(EchoSession)
        }
    }

    struct Collector {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl SessionHandler for Collector {
        async fn on_received(&self, _session: &Arc<Session>, data: &[u8]) {
            self.tx.send(data.to_vec()).ok();
        }
    }

    async fn start_echo_server() -> TcpServer {
        let server = TcpServer::new(TcpConfig::default(), Arc::new(EchoServer));
        server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        server
    }

    /// `connect` resolves once TCP is established; the session flags settle
    /// on the driver task shortly after.
    async fn wait_ready(client: &TcpClient) {
        timeout(Duration::from_secs(5), async {
            while !client.is_handshaked() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("client did not become ready");
    }

    #[tokio::test]
    async fn test_client_echo_roundtrip() {
        let server = start_echo_server().await;
        let addr = server.address().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TcpClient::new(TcpConfig::default(), Arc::new(Collector { tx }));
        client.connect(addr).await.unwrap();
        wait_ready(&client).await;

        assert!(client.send(b"hello"));
        let reply = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"hello");

        let session = client.session().unwrap();
        assert_eq!(session.bytes_sent(), 5);
        assert_eq!(session.bytes_received(), 5);

        assert!(client.disconnect().await);
        assert!(!client.is_connected());
        assert!(!client.send(b"after"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_sync_waits_for_drain() {
        let server = start_echo_server().await;
        let addr = server.address().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TcpClient::new(TcpConfig::default(), Arc::new(Collector { tx }));
        client.connect(addr).await.unwrap();
        wait_ready(&client).await;

        let sent = client.send_sync(b"direct").await.unwrap();
        assert_eq!(sent, 6);
        let session = client.session().unwrap();
        assert_eq!(session.bytes_pending(), 0);
        assert_eq!(session.bytes_sending(), 0);

        let reply = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"direct");

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let server = start_echo_server().await;
        let addr = server.address().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = TcpClient::new(TcpConfig::default(), Arc::new(Collector { tx }));
        client.connect(addr).await.unwrap();
        wait_ready(&client).await;
        assert!(client.disconnect().await);

        client.reconnect().await.unwrap();
        wait_ready(&client).await;
        assert!(client.is_connected());
        assert!(client.send(b"back"));
        let reply = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"back");

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    struct ByteCounter {
        total: Arc<std::sync::atomic::AtomicU64>,
    }

    #[async_trait]
    impl SessionHandler for ByteCounter {
        async fn on_received(&self, _session: &Arc<Session>, data: &[u8]) {
            self.total
                .fetch_add(data.len() as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_preserve_bytes() {
        let server = start_echo_server().await;
        let addr = server.address().unwrap();

        let total = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let client = TcpClient::new(
            TcpConfig::default(),
            Arc::new(ByteCounter {
                total: total.clone(),
            }),
        );
        client.connect(addr).await.unwrap();
        wait_ready(&client).await;

        // Appends interleave across tasks; the echoed byte count must still
        // balance exactly.
        let mut tasks = Vec::new();
        for t in 0..4u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    assert!(client.send(&[t; 64]));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let expected = 4 * 100 * 64;
        timeout(Duration::from_secs(10), async {
            while total.load(std::sync::atomic::Ordering::Relaxed) != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("echoed byte count never balanced");

        let session = client.session().unwrap();
        assert_eq!(session.bytes_sent(), expected);
        assert_eq!(session.bytes_received(), expected);

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_error() {
        // Bind a port and close it again so nothing is listening there.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = TcpClient::new(TcpConfig::default(), Arc::new(Collector { tx }));
        let err = client.connect(addr).await;
        assert!(matches!(err, Err(TransportError::ConnectionRefused)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_double_connect_is_rejected() {
        let server = start_echo_server().await;
        let addr = server.address().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let client = TcpClient::new(TcpConfig::default(), Arc::new(Collector { tx }));
        client.connect(addr).await.unwrap();
        wait_ready(&client).await;

        let err = client.connect(addr).await;
        assert!(matches!(err, Err(TransportError::AlreadyStarted)));

        client.disconnect().await;
        server.stop().await.unwrap();
    }
}
