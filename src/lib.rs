//! Asynchronous TCP, TLS and UDP server/client endpoints on Tokio.
//!
//! This crate provides the session/connection lifecycle engine for socket
//! services: servers that accept connections into [`Session`]s, clients that
//! initiate them, and datagram endpoints with multicast membership. Sessions
//! run a continuous receive pump and a double-buffered send pipeline with at
//! most one socket write in flight, so callers get a cheap lock-and-append
//! send path, bounded memory and per-session back-pressure.
//!
//! ## Features
//!
//! - **TCP/TLS servers**: accept loop, session registry, broadcast to all
//!   sessions, start/stop/restart lifecycle
//! - **TCP/TLS clients**: connect/disconnect/reconnect over the same session
//!   engine
//! - **TLS sessions**: handshake phase with a prepared `rustls` config
//!   between `connected` and the first byte
//! - **UDP endpoints**: single-shot send/receive, multicast group join/leave
//! - **Handler traits**: user code observes `on_connected`, `on_received`,
//!   `on_sent`, `on_disconnected`, … through injected capability sets
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use netpoint::{Session, SessionHandler, ServerHandler, TcpConfig, TcpServer};
//!
//! struct EchoSession;
//!
//! #[async_trait]
//! impl SessionHandler for EchoSession {
//!     async fn on_received(&self, session: &Arc<Session>, data: &[u8]) {
//!         session.send(data);
//!     }
//! }
//!
//! struct EchoServer;
//!
//! #[async_trait]
//! impl ServerHandler for EchoServer {
//!     fn create_session(&self) -> Arc<dyn SessionHandler> {
//!         Arc::new(EchoSession)
//!     }
//! }
//!
//! # async fn example() -> netpoint::Result<()> {
//! let server = TcpServer::new(TcpConfig::default(), Arc::new(EchoServer));
//! server.start("127.0.0.1:4444".parse().unwrap()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;
pub mod udp;

mod send_pipeline;
#[cfg(unix)]
mod sockopt;

// Re-export the main types
pub use buffer::ByteBuffer;
pub use client::{TcpClient, TlsClient};
pub use config::{TcpConfig, UdpConfig};
pub use endpoint::{resolve, MulticastGroup};
pub use error::{Result, TransportError};
pub use handler::{DatagramHandler, NoopSessionHandler, ServerHandler, SessionHandler};
pub use server::{ServerStats, TcpServer, TlsServer};
pub use session::{Session, SessionStats};
pub use stream::IoStream;
pub use tls::{TlsClientContext, TlsServerContext};
pub use udp::{UdpEndpoint, UdpStats};
