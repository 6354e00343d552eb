//! Session: one accepted or initiated stream connection.
//!
//! A session drives the continuous receive pump and the double-buffered send
//! pipeline over an [`IoStream`], inserting a TLS handshake phase between
//! `connected` and the first byte when the stream is secured. Accepted
//! sessions hold a non-owning back-reference to their server for counter
//! aggregation and registry removal; clients run the same engine without a
//! parent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::buffer::ByteBuffer;
use crate::config::TcpConfig;
use crate::error::{Result, TransportError};
use crate::handler::SessionHandler;
use crate::send_pipeline::SendPipeline;
use crate::stream::IoStream;
use crate::tls::{TlsClientContext, TlsServerContext};

/// How a session secures its stream.
pub(crate) enum TlsRole {
    /// Plain TCP, no handshake phase.
    None,
    /// Server-side TLS: accept a handshake with the prepared config.
    Server(TlsServerContext),
    /// Client-side TLS: initiate a handshake with the prepared config.
    Client(TlsClientContext),
}

/// Hooks a session uses to report back to its owning server.
pub(crate) trait SessionParent: Send + Sync {
    fn credit_sent(&self, n: u64);
    fn credit_received(&self, n: u64);
    fn unregister_session(&self, id: Uuid);
}

/// Point-in-time snapshot of a session's flags and counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session identifier
    pub id: Uuid,
    /// Remote peer address
    pub peer: SocketAddr,
    /// Whether the connection is established
    pub connected: bool,
    /// Whether the TLS handshake completed (always true for plain TCP once
    /// connected)
    pub handshaked: bool,
    /// Total bytes written to the socket
    pub bytes_sent: u64,
    /// Total bytes read from the socket
    pub bytes_received: u64,
    /// Bytes queued in the main buffer
    pub bytes_pending: u64,
    /// Bytes handed to the in-flight write
    pub bytes_sending: u64,
}

/// One established bidirectional byte stream between two endpoints.
pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    local: SocketAddr,
    tls: bool,
    config: TcpConfig,
    handler: Arc<dyn SessionHandler>,
    parent: Option<Weak<dyn SessionParent>>,
    connected: AtomicBool,
    handshaked: AtomicBool,
    receiving: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pipeline: SendPipeline,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session{{id:{}, peer:{}}}", self.id, self.peer)
    }
}

impl Session {
    pub(crate) fn new(
        peer: SocketAddr,
        local: SocketAddr,
        config: TcpConfig,
        handler: Arc<dyn SessionHandler>,
        parent: Option<Weak<dyn SessionParent>>,
        tls: bool,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let send_capacity = config.send_buffer_size;
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            local,
            tls,
            config,
            handler,
            parent,
            connected: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            pipeline: SendPipeline::new(send_capacity),
            closed,
        })
    }

    /// Unique identifier, assigned on creation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Whether this session runs over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the session is ready for application data. Plain sessions are
    /// handshaked as soon as they connect.
    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::Acquire)
    }

    /// Whether a read is outstanding on the socket.
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Whether a write is outstanding on the socket.
    pub fn is_sending(&self) -> bool {
        self.pipeline.is_sending()
    }

    /// Total bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read from the socket.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes queued but not yet handed to a write.
    pub fn bytes_pending(&self) -> u64 {
        self.pipeline.bytes_pending()
    }

    /// Bytes handed to the in-flight write.
    pub fn bytes_sending(&self) -> u64 {
        self.pipeline.bytes_sending()
    }

    /// Snapshot flags and counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            peer: self.peer,
            connected: self.is_connected(),
            handshaked: self.is_handshaked(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            bytes_pending: self.bytes_pending(),
            bytes_sending: self.bytes_sending(),
        }
    }

    /// Queue bytes for asynchronous transmission.
    ///
    /// Returns false when the session is not connected or, for TLS, not yet
    /// handshaked; errors never surface here.
    pub fn send(&self, data: &[u8]) -> bool {
        if !self.is_connected() || !self.is_handshaked() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.pipeline.append(data)
    }

    /// Queue a text payload for asynchronous transmission.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(text.as_bytes())
    }

    /// Send and wait until the bytes have been handed to the socket.
    ///
    /// Serialized through the same pipeline as [`send`](Self::send), so it
    /// never interleaves with an in-flight asynchronous write. Returns the
    /// number of bytes accepted.
    pub async fn send_sync(&self, data: &[u8]) -> Result<u64> {
        if !self.is_connected() || !self.is_handshaked() {
            return Err(TransportError::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if !self.pipeline.append(data) {
            return Err(TransportError::NotConnected);
        }
        self.flush().await?;
        Ok(data.len() as u64)
    }

    /// Wait until every queued byte has been handed to the socket.
    pub async fn flush(&self) -> Result<()> {
        loop {
            let drained = self.pipeline.drained_notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pipeline.is_idle() {
                return Ok(());
            }
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            drained.await;
        }
    }

    /// Tear the session down.
    ///
    /// Idempotent; flips the flags and wakes the pumps immediately. Socket
    /// shutdown, `on_disconnecting`/`on_disconnected` and registry removal
    /// complete on the session's driver. Returns true only for the first
    /// call that observed the session connected.
    pub fn disconnect(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.pipeline.close();
        let already_closed = self.closed.send_replace(true);
        if was_connected && !already_closed {
            debug!(id = %self.id, peer = %self.peer, "session disconnecting");
        }
        was_connected
    }

    /// Run the session to completion: optional handshake, then both pumps.
    pub(crate) async fn drive(self: Arc<Self>, stream: TcpStream, role: TlsRole) {
        let handler = self.handler.clone();
        let mut closed = self.closed.subscribe();

        handler.on_connecting(&self).await;
        if *closed.borrow() {
            // Torn down before it ever connected; just drop the registry entry.
            self.unregister();
            return;
        }
        self.connected.store(true, Ordering::Release);
        handler.on_connected(&self).await;

        let io = match role {
            TlsRole::None => {
                self.handshaked.store(true, Ordering::Release);
                IoStream::Plain(stream)
            }
            TlsRole::Server(ctx) => {
                handler.on_handshaking(&self).await;
                let accepted = tokio::select! {
                    r = ctx.acceptor().accept(stream) => r,
                    _ = closed.changed() => {
                        Self::finish(&self).await;
                        return;
                    }
                };
                match accepted {
                    Ok(tls) => IoStream::Tls(Box::new(tls)),
                    Err(e) => {
                        warn!(id = %self.id, peer = %self.peer, error = %e, "tls accept failed");
                        handler.on_error(&self, &TransportError::NotConnected).await;
                        Self::finish(&self).await;
                        return;
                    }
                }
            }
            TlsRole::Client(ctx) => {
                handler.on_handshaking(&self).await;
                let connected = tokio::select! {
                    r = ctx.connector().connect(ctx.server_name(), stream) => r,
                    _ = closed.changed() => {
                        Self::finish(&self).await;
                        return;
                    }
                };
                match connected {
                    Ok(tls) => IoStream::TlsClient(Box::new(tls)),
                    Err(e) => {
                        warn!(id = %self.id, peer = %self.peer, error = %e, "tls connect failed");
                        handler.on_error(&self, &TransportError::NotConnected).await;
                        Self::finish(&self).await;
                        return;
                    }
                }
            }
        };

        if io.is_tls() {
            self.handshaked.store(true, Ordering::Release);
            handler.on_handshaked(&self).await;
        }
        if self.pipeline.is_idle() {
            handler.on_empty(&self).await;
        }

        let (reader, writer) = tokio::io::split(io);
        let recv_task = tokio::spawn(Self::receive_pump(self.clone(), reader));
        let send_task = tokio::spawn(Self::send_pump(self.clone(), writer));

        // The receive pump ends on peer close, error or disconnect; all of
        // them terminate the whole session.
        let recv_res = recv_task.await;
        self.disconnect();
        let send_res = send_task.await;

        for res in [recv_res, send_res] {
            if let Err(e) = res {
                if e.is_panic() {
                    warn!(id = %self.id, "session callback panicked");
                    let err =
                        TransportError::Io(std::io::Error::other("session callback panicked"));
                    handler.on_error(&self, &err).await;
                }
            }
        }
        Self::finish(&self).await;
    }

    /// One read outstanding at a time; re-arms only after the handler
    /// returns, which is what back-pressures a fast peer.
    async fn receive_pump(session: Arc<Session>, mut reader: ReadHalf<IoStream>) {
        let handler = session.handler.clone();
        let mut closed = session.closed.subscribe();
        let mut capacity = session.config.receive_buffer_size.max(64);
        let cap_limit = session.config.max_receive_buffer_size.max(capacity);
        let mut buf = ByteBuffer::with_capacity(capacity);

        loop {
            if *closed.borrow() {
                break;
            }
            buf.resize(capacity);
            session.receiving.store(true, Ordering::Release);
            let read = tokio::select! {
                r = reader.read(buf.as_mut_slice()) => r,
                _ = closed.changed() => {
                    session.receiving.store(false, Ordering::Release);
                    break;
                }
            };
            session.receiving.store(false, Ordering::Release);

            match read {
                Ok(0) => {
                    // Peer closed its side.
                    session.disconnect();
                    break;
                }
                Ok(n) => {
                    session.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    session.credit_parent_received(n as u64);
                    handler.on_received(&session, &buf.as_slice()[..n]).await;
                    if n == capacity && capacity < cap_limit {
                        capacity = (capacity * 2).min(cap_limit);
                    }
                }
                Err(e) => {
                    Self::report_error(&session, e.into()).await;
                    session.disconnect();
                    break;
                }
            }
        }
    }

    /// One write outstanding at a time, drawn from the swapped flush buffer.
    async fn send_pump(session: Arc<Session>, mut writer: WriteHalf<IoStream>) {
        let handler = session.handler.clone();
        let mut closed = session.closed.subscribe();
        let mut flush = ByteBuffer::with_capacity(session.config.send_buffer_size);
        let mut offset: usize = 0;
        let mut drained = false;

        'pump: loop {
            if *closed.borrow() {
                break;
            }
            if offset >= flush.len() {
                flush.clear();
                offset = 0;
                if !session.pipeline.swap_into(&mut flush) {
                    if drained {
                        drained = false;
                        handler.on_empty(&session).await;
                        continue;
                    }
                    tokio::select! {
                        _ = session.pipeline.writer_notified() => {}
                        _ = closed.changed() => break,
                    }
                    continue;
                }
            }

            session.pipeline.begin_send();
            let write = tokio::select! {
                r = writer.write(&flush.as_slice()[offset..]) => r,
                _ = closed.changed() => {
                    session.pipeline.abort_send();
                    break;
                }
            };
            match write {
                Ok(0) => {
                    session.pipeline.abort_send();
                    let err = std::io::Error::new(std::io::ErrorKind::WriteZero, "socket write returned zero");
                    Self::report_error(&session, err.into()).await;
                    session.disconnect();
                    break;
                }
                Ok(n) => {
                    // TLS buffers records internally; push them out before
                    // crediting the completion.
                    let flushed = tokio::select! {
                        r = writer.flush() => r,
                        _ = closed.changed() => {
                            session.pipeline.abort_send();
                            break 'pump;
                        }
                    };
                    if let Err(e) = flushed {
                        session.pipeline.abort_send();
                        Self::report_error(&session, e.into()).await;
                        session.disconnect();
                        break;
                    }
                    offset += n;
                    let still = session.pipeline.complete_send(n as u64);
                    session.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    session.credit_parent_sent(n as u64);
                    handler.on_sent(&session, n as u64, still).await;
                    if still == 0 {
                        drained = true;
                    }
                }
                Err(e) => {
                    session.pipeline.abort_send();
                    Self::report_error(&session, e.into()).await;
                    session.disconnect();
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn report_error(session: &Arc<Session>, err: TransportError) {
        if err.is_expected_disconnect() {
            debug!(id = %session.id, peer = %session.peer, error = %err, "peer disconnect");
        } else {
            warn!(id = %session.id, peer = %session.peer, error = %err, "session error");
            session.handler.on_error(session, &err).await;
        }
    }

    /// Final teardown, run exactly once from the driver.
    async fn finish(session: &Arc<Session>) {
        session.disconnect();
        session.handshaked.store(false, Ordering::Release);
        session.handler.on_disconnecting(session).await;
        session.handler.on_disconnected(session).await;
        session.unregister();
        debug!(id = %session.id, peer = %session.peer, "session closed");
    }

    fn unregister(&self) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.unregister_session(self.id);
        }
    }

    fn credit_parent_sent(&self, n: u64) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.credit_sent(n);
        }
    }

    fn credit_parent_received(&self, n: u64) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.credit_received(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopSessionHandler;

    fn idle_session() -> Arc<Session> {
        Session::new(
            "127.0.0.1:9999".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            TcpConfig::default(),
            Arc::new(NoopSessionHandler),
            None,
            false,
        )
    }

    #[test]
    fn test_send_refused_before_connect() {
        let session = idle_session();
        assert!(!session.is_connected());
        assert!(!session.send(b"hello"));
        assert_eq!(session.bytes_pending(), 0);
    }

    #[test]
    fn test_disconnect_before_connect_returns_false() {
        let session = idle_session();
        assert!(!session.disconnect());
        assert!(!session.disconnect());
    }

    #[tokio::test]
    async fn test_send_sync_refused_before_connect() {
        let session = idle_session();
        let err = session.send_sync(b"hello").await;
        assert!(matches!(err, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_stats_snapshot() {
        let session = idle_session();
        let stats = session.stats();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.bytes_received, 0);
        assert!(!stats.connected);
        assert!(!stats.handshaked);
        assert_eq!(stats.peer, session.peer_addr());
    }
}
