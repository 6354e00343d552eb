//! Transport error types and classification.

use thiserror::Error;

/// Convenience alias for results carrying a [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by servers, clients, sessions and datagram endpoints.
///
/// Kinds mirroring an expected peer disconnect (`ConnectionAborted`,
/// `ConnectionRefused`, `ConnectionReset`, `OperationAborted`) are filtered
/// out before reaching `on_error`; see
/// [`is_expected_disconnect`](TransportError::is_expected_disconnect).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection aborted by the local stack
    #[error("connection aborted")]
    ConnectionAborted,

    /// Connection refused by the peer
    #[error("connection refused")]
    ConnectionRefused,

    /// Connection reset by the peer
    #[error("connection reset")]
    ConnectionReset,

    /// Outstanding operation aborted by teardown
    #[error("operation aborted")]
    OperationAborted,

    /// Endpoint is not connected (also reported for failed TLS handshakes)
    #[error("not connected")]
    NotConnected,

    /// Operation timed out
    #[error("timed out")]
    TimedOut,

    /// Network unreachable
    #[error("network unreachable")]
    NetworkUnreachable,

    /// Host unreachable
    #[error("host unreachable")]
    HostUnreachable,

    /// Datagram exceeds the maximum message size
    #[error("message too large")]
    MessageSize,

    /// Bind address already in use
    #[error("address in use")]
    AddrInUse,

    /// Address or name could not be resolved or parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Endpoint was already started or connected
    #[error("already started")]
    AlreadyStarted,

    /// Endpoint was not started or connected
    #[error("not started")]
    NotStarted,

    /// A synchronous send was rejected because an asynchronous send is in flight
    #[error("send already in flight")]
    SendPending,

    /// TLS configuration problem
    #[error("tls: {0}")]
    Tls(String),

    /// Unclassified I/O error
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}

impl TransportError {
    /// Whether this kind signals an ordinary peer disconnect.
    ///
    /// These are suppressed before `on_error`; the disconnect path still runs.
    pub fn is_expected_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionAborted
                | Self::ConnectionRefused
                | Self::ConnectionReset
                | Self::OperationAborted
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            // Writes after peer close surface as EPIPE; same disconnect family.
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => Self::ConnectionReset,
            ErrorKind::Interrupted => Self::OperationAborted,
            ErrorKind::NotConnected => Self::NotConnected,
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::AddrInUse => Self::AddrInUse,
            ErrorKind::NetworkUnreachable => Self::NetworkUnreachable,
            ErrorKind::HostUnreachable => Self::HostUnreachable,
            _ => {
                #[cfg(unix)]
                if err.raw_os_error() == Some(libc::EMSGSIZE) {
                    return Self::MessageSize;
                }
                Self::Io(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_disconnect_kinds_are_filtered() {
        assert!(TransportError::ConnectionReset.is_expected_disconnect());
        assert!(TransportError::ConnectionAborted.is_expected_disconnect());
        assert!(TransportError::ConnectionRefused.is_expected_disconnect());
        assert!(TransportError::OperationAborted.is_expected_disconnect());

        assert!(!TransportError::NotConnected.is_expected_disconnect());
        assert!(!TransportError::TimedOut.is_expected_disconnect());
        assert!(!TransportError::MessageSize.is_expected_disconnect());
    }

    #[test]
    fn test_io_classification() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(
            TransportError::from(reset),
            TransportError::ConnectionReset
        ));

        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(matches!(
            TransportError::from(pipe),
            TransportError::ConnectionReset
        ));

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(
            TransportError::from(timeout),
            TransportError::TimedOut
        ));

        let other = io::Error::other("something else");
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_emsgsize_maps_to_message_size() {
        let err = io::Error::from_raw_os_error(libc::EMSGSIZE);
        assert!(matches!(
            TransportError::from(err),
            TransportError::MessageSize
        ));
    }
}
