//! TCP and TLS servers: accept loop, session registry, broadcast, lifecycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TcpConfig;
use crate::error::{Result, TransportError};
use crate::handler::ServerHandler;
use crate::session::{Session, SessionParent, TlsRole};
use crate::tls::TlsServerContext;

/// Aggregate server counters.
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Currently registered sessions
    pub sessions: usize,
    /// Highest number of simultaneously registered sessions
    pub peak_sessions: usize,
    /// Total bytes written across all sessions
    pub bytes_sent: u64,
    /// Total bytes read across all sessions
    pub bytes_received: u64,
}

pub(crate) struct ServerCore {
    config: TcpConfig,
    handler: Arc<dyn ServerHandler>,
    tls: Option<TlsServerContext>,
    sessions: DashMap<Uuid, Arc<Session>>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    bind_addr: Mutex<Option<SocketAddr>>,
    accept_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    stop_signal: watch::Sender<bool>,
    session_drained: Notify,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    peak_sessions: AtomicUsize,
}

impl SessionParent for ServerCore {
    fn credit_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    fn credit_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    fn unregister_session(&self, id: Uuid) {
        if self.sessions.remove(&id).is_some() {
            debug!(id = %id, sessions = self.sessions.len(), "session unregistered");
        }
        self.session_drained.notify_waiters();
    }
}

impl ServerCore {
    fn new(
        config: TcpConfig,
        handler: Arc<dyn ServerHandler>,
        tls: Option<TlsServerContext>,
    ) -> Arc<Self> {
        let (stop_signal, _) = watch::channel(false);
        Arc::new(Self {
            config,
            handler,
            tls,
            sessions: DashMap::new(),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            bind_addr: Mutex::new(None),
            accept_task: AsyncMutex::new(None),
            stop_signal,
            session_drained: Notify::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            peak_sessions: AtomicUsize::new(0),
        })
    }

    fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }?;
        if self.config.reuse_address {
            socket.set_reuseaddr(true)?;
        }
        #[cfg(unix)]
        if self.config.reuse_port {
            socket.set_reuseport(true)?;
        }
        #[cfg(unix)]
        if addr.is_ipv6() && self.config.dual_mode {
            use std::os::fd::AsRawFd;
            crate::sockopt::set_only_v6(socket.as_raw_fd(), false)?;
        }
        // Accepted sockets inherit the listener's buffer hints.
        if self.config.receive_buffer_size > 0 {
            socket.set_recv_buffer_size(self.config.receive_buffer_size as u32)?;
        }
        if self.config.send_buffer_size > 0 {
            socket.set_send_buffer_size(self.config.send_buffer_size as u32)?;
        }
        socket.bind(addr)?;
        Ok(socket.listen(self.config.accept_backlog)?)
    }

    async fn start(core: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        if core.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = match core.bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                core.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let local = listener.local_addr()?;
        *core.local_addr.lock().expect("server lock poisoned") = Some(local);
        *core.bind_addr.lock().expect("server lock poisoned") = Some(addr);
        core.stop_signal.send_replace(false);
        info!(addr = %local, tls = core.tls.is_some(), "server started");
        core.handler.on_started(local).await;

        let task = tokio::spawn(Self::accept_loop(core.clone(), listener));
        *core.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Exactly one accept outstanding while started; listener errors are
    /// reported and the loop re-arms.
    async fn accept_loop(core: Arc<Self>, listener: TcpListener) {
        let mut stop = core.stop_signal.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                r = listener.accept() => match r {
                    Ok((stream, peer)) => {
                        // Re-arm immediately; connection setup and the user
                        // callbacks run off the accept path.
                        let core = core.clone();
                        tokio::spawn(Self::setup_session(core, stream, peer));
                    }
                    Err(e) => {
                        let err = TransportError::from(e);
                        if !err.is_expected_disconnect() {
                            warn!(error = %err, "accept failed");
                            core.handler.on_error(&err).await;
                        }
                    }
                },
                _ = stop.changed() => break,
            }
        }
        debug!("accept loop ended");
    }

    /// Runs on its own task, one per accepted connection.
    async fn setup_session(core: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
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
        let local = stream
            .local_addr()
            .ok()
            .or_else(|| *core.local_addr.lock().expect("server lock poisoned"))
            .unwrap_or(peer);

        let session_handler = core.handler.create_session();
        let parent: Weak<dyn SessionParent> = Arc::downgrade(&(core.clone() as Arc<dyn SessionParent>));
        let session = Session::new(
            peer,
            local,
            core.config.clone(),
            session_handler,
            Some(parent),
            core.tls.is_some(),
        );
        core.sessions.insert(session.id(), session.clone());
        core.peak_sessions
            .fetch_max(core.sessions.len(), Ordering::Relaxed);
        debug!(id = %session.id(), peer = %peer, sessions = core.sessions.len(), "session accepted");

        // A stop that ran between the accept and this registration has
        // already taken its disconnect snapshot; close the latecomer here.
        if !core.started.load(Ordering::Acquire) {
            session.disconnect();
        }

        core.handler.on_connecting(&session).await;
        core.handler.on_connected(&session).await;

        let role = match &core.tls {
            Some(ctx) => TlsRole::Server(ctx.clone()),
            None => TlsRole::None,
        };
        session.drive(stream, role).await;
    }

    async fn stop(core: &Arc<Self>) -> Result<()> {
        if !core.started.swap(false, Ordering::AcqRel) {
            return Err(TransportError::NotStarted);
        }
        core.handler.on_stopping().await;
        core.stop_signal.send_replace(true);
        if let Some(task) = core.accept_task.lock().await.take() {
            // The listener is dropped when the loop exits.
            let _ = task.await;
        }

        Self::disconnect_all(core);
        loop {
            let drained = core.session_drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if core.sessions.is_empty() {
                break;
            }
            drained.await;
        }

        *core.local_addr.lock().expect("server lock poisoned") = None;
        info!("server stopped");
        core.handler.on_stopped().await;
        Ok(())
    }

    async fn restart(core: &Arc<Self>) -> Result<()> {
        let addr = core
            .bind_addr
            .lock()
            .expect("server lock poisoned")
            .ok_or(TransportError::NotStarted)?;
        Self::stop(core).await?;
        Self::start(core, addr).await?;
        info!("server restarted");
        core.handler.on_restarted().await;
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        // Taken before dispatch so no registry lock is held across callbacks.
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    fn multicast(&self, data: &[u8]) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        for session in self.snapshot() {
            session.send(data);
        }
        true
    }

    async fn multicast_sync(&self, data: &[u8]) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        for session in self.snapshot() {
            // Dead sessions refuse the send; that is their disconnect path.
            let _ = session.send_sync(data).await;
        }
        true
    }

    fn disconnect_all(core: &Arc<Self>) {
        for session in core.snapshot() {
            session.disconnect();
        }
    }

    fn stats(&self) -> ServerStats {
        ServerStats {
            sessions: self.sessions.len(),
            peak_sessions: self.peak_sessions.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

macro_rules! delegate_server_api {
    () => {
        /// Bind, listen and run the accept loop on `addr`.
        pub async fn start(&self, addr: SocketAddr) -> Result<()> {
            ServerCore::start(&self.core, addr).await
        }

        /// Close the listener and disconnect every session.
        pub async fn stop(&self) -> Result<()> {
            ServerCore::stop(&self.core).await
        }

        /// Stop and start again on the original bind address.
        pub async fn restart(&self) -> Result<()> {
            ServerCore::restart(&self.core).await
        }

        /// Queue `data` on every registered session. Non-blocking.
        pub fn multicast(&self, data: &[u8]) -> bool {
            self.core.multicast(data)
        }

        /// Queue a text payload on every registered session.
        pub fn multicast_text(&self, text: &str) -> bool {
            self.core.multicast(text.as_bytes())
        }

        /// Send `data` to every registered session, waiting for each
        /// session's pipeline to drain.
        pub async fn multicast_sync(&self, data: &[u8]) -> bool {
            self.core.multicast_sync(data).await
        }

        /// Disconnect every session without stopping the listener.
        pub fn disconnect_all(&self) {
            ServerCore::disconnect_all(&self.core);
        }

        /// Whether the accept loop is running.
        pub fn is_started(&self) -> bool {
            self.core.started.load(Ordering::Acquire)
        }

        /// Bound listener address while started.
        pub fn address(&self) -> Option<SocketAddr> {
            *self.core.local_addr.lock().expect("server lock poisoned")
        }

        /// Look up a registered session by identifier.
        pub fn session(&self, id: Uuid) -> Option<Arc<Session>> {
            self.core.sessions.get(&id).map(|e| e.value().clone())
        }

        /// Number of currently registered sessions.
        pub fn session_count(&self) -> usize {
            self.core.sessions.len()
        }

        /// Total bytes written across all sessions.
        pub fn bytes_sent(&self) -> u64 {
            self.core.bytes_sent.load(Ordering::Relaxed)
        }

        /// Total bytes read across all sessions.
        pub fn bytes_received(&self) -> u64 {
            self.core.bytes_received.load(Ordering::Relaxed)
        }

        /// Aggregate counters snapshot.
        pub fn stats(&self) -> ServerStats {
            self.core.stats()
        }
    };
}

/// Asynchronous TCP server.
///
/// Accepted connections become [`Session`]s driven by the handler returned
/// from the server handler's `create_session` factory.
#[derive(Clone)]
pub struct TcpServer {
    core: Arc<ServerCore>,
}

impl TcpServer {
    /// Create a server from its configuration and handler.
    pub fn new(config: TcpConfig, handler: Arc<dyn ServerHandler>) -> Self {
        Self {
            core: ServerCore::new(config, handler, None),
        }
    }

    delegate_server_api!();
}

/// Asynchronous TLS server: a [`TcpServer`] whose sessions handshake with a
/// prepared TLS configuration before any application data flows.
#[derive(Clone)]
pub struct TlsServer {
    core: Arc<ServerCore>,
}

impl TlsServer {
    /// Create a server from its configuration, handler and TLS context.
    pub fn new(config: TcpConfig, handler: Arc<dyn ServerHandler>, tls: TlsServerContext) -> Self {
        Self {
            core: ServerCore::new(config, handler, Some(tls)),
        }
    }

    delegate_server_api!();
}
