//! Unified stream type over plain TCP and TLS connections.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// One bidirectional byte stream, plain or TLS-wrapped.
///
/// Sessions operate on this type so the receive pump and send pipeline are
/// identical across transports; only the handshake phase differs.
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS stream accepted by a server
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// TLS stream initiated by a client
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl IoStream {
    /// Address of the remote peer.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Whether the stream carries a TLS session.
    pub fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            IoStream::Plain(stream) => stream,
            IoStream::Tls(stream) => stream.get_ref().0,
            IoStream::TlsClient(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_stream_addresses() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();

        let connect = tokio::spawn(async move { TcpStream::connect(bound).await.unwrap() });
        let (accepted, peer) = listener.accept().await.unwrap();
        let stream = IoStream::Plain(accepted);

        assert!(!stream.is_tls());
        assert_eq!(stream.peer_addr().unwrap(), peer);
        assert_eq!(stream.local_addr().unwrap(), bound);
        connect.await.unwrap();
    }
}
