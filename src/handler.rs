//! User-facing callback surfaces.
//!
//! Extension happens through handler capability sets rather than
//! inheritance: each trait method has a default no-op body, so a handler
//! implements only the callbacks it cares about. Handlers are passed around
//! as `Arc<dyn …>` and dispatched from the endpoint's driver tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::session::Session;
use crate::udp::UdpEndpoint;

/// Callbacks for one stream connection (server-side session or client).
///
/// Delivery contract, per session: `on_connected` precedes every other
/// callback, `on_disconnected` is the last and each fires exactly once;
/// `on_handshaked` (TLS only) falls between `on_connected` and the first
/// `on_received`; `on_received` calls are strictly ordered. The receive pump
/// does not re-arm until `on_received` returns, so a slow handler
/// back-pressures the peer.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// The connection is about to become usable.
    async fn on_connecting(&self, _session: &Arc<Session>) {}

    /// The connection is established.
    async fn on_connected(&self, _session: &Arc<Session>) {}

    /// TLS negotiation is starting.
    async fn on_handshaking(&self, _session: &Arc<Session>) {}

    /// TLS negotiation completed; the session now accepts `send`.
    async fn on_handshaked(&self, _session: &Arc<Session>) {}

    /// Bytes arrived from the peer.
    async fn on_received(&self, _session: &Arc<Session>, _data: &[u8]) {}

    /// A socket write completed. `sent` is the byte count of this write,
    /// `pending` the bytes still queued or in flight.
    async fn on_sent(&self, _session: &Arc<Session>, _sent: u64, _pending: u64) {}

    /// The send pipeline just drained.
    async fn on_empty(&self, _session: &Arc<Session>) {}

    /// Teardown started.
    async fn on_disconnecting(&self, _session: &Arc<Session>) {}

    /// Teardown finished; no further callbacks fire for this session.
    async fn on_disconnected(&self, _session: &Arc<Session>) {}

    /// A non-disconnect error was observed on this session.
    async fn on_error(&self, _session: &Arc<Session>, _error: &TransportError) {}
}

/// A [`SessionHandler`] that ignores every callback.
#[derive(Debug, Default)]
pub struct NoopSessionHandler;

#[async_trait]
impl SessionHandler for NoopSessionHandler {}

/// Callbacks and the session factory for a TCP/TLS server.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Produce the handler for a freshly accepted session.
    fn create_session(&self) -> Arc<dyn SessionHandler> {
        Arc::new(NoopSessionHandler)
    }

    /// The listener is bound and accepting on `addr`.
    async fn on_started(&self, _addr: SocketAddr) {}

    /// `stop` was requested; sessions are about to be disconnected.
    async fn on_stopping(&self) {}

    /// The listener is closed and every session has torn down.
    async fn on_stopped(&self) {}

    /// A `restart` cycle completed.
    async fn on_restarted(&self) {}

    /// A session was accepted and registered, before its own callbacks run.
    async fn on_connecting(&self, _session: &Arc<Session>) {}

    /// Server-side notification for a newly accepted session.
    async fn on_connected(&self, _session: &Arc<Session>) {}

    /// A non-disconnect error was observed on the listener.
    async fn on_error(&self, _error: &TransportError) {}
}

/// Callbacks for a datagram endpoint.
///
/// The endpoint does not re-arm reception by itself: call
/// [`UdpEndpoint::receive`] again from `on_received`/`on_sent` to keep
/// datagrams flowing.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    /// The socket is bound (and joined to its group when multicast).
    async fn on_started(&self, _endpoint: &UdpEndpoint) {}

    /// The socket is closed.
    async fn on_stopped(&self, _endpoint: &UdpEndpoint) {}

    /// A `restart` cycle completed.
    async fn on_restarted(&self, _endpoint: &UdpEndpoint) {}

    /// A datagram arrived from `peer`.
    async fn on_received(&self, _endpoint: &UdpEndpoint, _peer: SocketAddr, _data: &[u8]) {}

    /// A datagram was handed to the socket for `peer`.
    async fn on_sent(&self, _endpoint: &UdpEndpoint, _peer: SocketAddr, _sent: usize) {}

    /// A non-disconnect error was observed on the socket.
    async fn on_error(&self, _endpoint: &UdpEndpoint, _error: &TransportError) {}
}
