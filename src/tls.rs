//! Prepared TLS configuration handed to TLS endpoints.
//!
//! Certificate material loading and validation policy live with the caller:
//! endpoints receive a ready `rustls` configuration (certificate chain,
//! allowed protocol versions, client-certificate requirement, custom peer
//! verifiers) and only drive the handshake with it.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Result, TransportError};

/// Server-side TLS context wrapping a prepared [`ServerConfig`].
#[derive(Clone)]
pub struct TlsServerContext {
    acceptor: TlsAcceptor,
}

impl TlsServerContext {
    /// Build a context from a prepared server configuration.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub(crate) fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

impl std::fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsServerContext")
    }
}

/// Client-side TLS context: a prepared [`ClientConfig`] plus the server name
/// presented for SNI and certificate verification.
#[derive(Clone)]
pub struct TlsClientContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClientContext {
    /// Build a context from a prepared client configuration and the name the
    /// peer's certificate must match.
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TransportError::Tls(format!("invalid server name: {server_name}")))?;
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

impl std::fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsClientContext{{server_name:{:?}}}", self.server_name)
    }
}
