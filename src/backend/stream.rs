//! TCP stream backend.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use super::{Acceptor, Backend, RecvOutcome, SendOutcome, map_recv, map_send};
use crate::addr::{TransportAddr, TransportKind};
use crate::error::{Error, Result};

/// Duplex TCP backend.
pub struct StreamBackend {
    stream: TcpStream,
    closed: AtomicBool,
}

impl StreamBackend {
    /// Wrap an already-connected stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a connection to `addr`.
    ///
    /// # Errors
    ///
    /// Transport-level connect failure.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        trace!(%addr, "stream backend connected");
        Ok(Self::new(stream))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for StreamBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn try_send(&self, buf: &[u8]) -> Result<SendOutcome> {
        self.check_open()?;
        map_send(self.stream.try_write(buf))
    }

    fn try_recv(&self, buf: &mut [u8]) -> Result<RecvOutcome> {
        self.check_open()?;
        map_recv(self.stream.try_read(buf))
    }

    async fn send_ready(&self) -> Result<()> {
        self.stream.writable().await?;
        Ok(())
    }

    async fn recv_ready(&self) -> Result<()> {
        self.stream.readable().await?;
        Ok(())
    }

    fn has_pending_data(&self) -> bool {
        false
    }

    fn local_addr(&self) -> Option<TransportAddr> {
        self.stream.local_addr().ok().map(TransportAddr::Stream)
    }

    fn peer_addr(&self) -> Option<TransportAddr> {
        self.stream.peer_addr().ok().map(TransportAddr::Stream)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("stream backend closed");
    }
}

/// TCP listening backend.
pub struct StreamAcceptor {
    listener: TcpListener,
    closed: AtomicBool,
}

impl StreamAcceptor {
    /// Bind a listener on `addr`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Bind failure (address in use, permissions, ...).
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        debug!(%addr, "stream acceptor bound");
        Ok(Self {
            listener,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Acceptor for StreamAcceptor {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn accept(&self) -> Result<(Box<dyn Backend>, TransportAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let (stream, peer) = self.listener.accept().await?;
        trace!(%peer, "stream acceptor accepted peer");
        Ok((
            Box::new(StreamBackend::new(stream)),
            TransportAddr::Stream(peer),
        ))
    }

    fn local_addr(&self) -> Option<TransportAddr> {
        self.listener.local_addr().ok().map(TransportAddr::Stream)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("stream acceptor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (StreamBackend, StreamBackend) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            StreamBackend::new(client.unwrap()),
            StreamBackend::new(server.unwrap().0),
        )
    }

    #[tokio::test]
    async fn test_acceptor_hands_out_backends() {
        let acceptor = StreamAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let Some(TransportAddr::Stream(addr)) = acceptor.local_addr() else {
            panic!("acceptor has no local addr");
        };

        let (client, accepted) = tokio::join!(StreamBackend::connect(addr), acceptor.accept());
        let client = client.unwrap();
        let (server, peer) = accepted.unwrap();

        assert_eq!(server.kind(), TransportKind::Stream);
        assert_eq!(peer.kind(), TransportKind::Stream);

        client.send_ready().await.unwrap();
        assert_eq!(client.try_send(b"ping").unwrap(), SendOutcome::Sent(4));
        server.recv_ready().await.unwrap();
        let mut buf = [0u8; 8];
        match server.try_recv(&mut buf).unwrap() {
            RecvOutcome::Read(n) => assert_eq!(&buf[..n], b"ping"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (client, server) = connected_pair().await;

        client.send_ready().await.unwrap();
        assert_eq!(
            client.try_send(b"hello").unwrap(),
            SendOutcome::Sent(5)
        );

        server.recv_ready().await.unwrap();
        let mut buf = [0u8; 16];
        match server.try_recv(&mut buf).unwrap() {
            RecvOutcome::Read(n) => assert_eq!(&buf[..n], b"hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recv_would_block_when_empty() {
        let (_client, server) = connected_pair().await;
        let mut buf = [0u8; 16];
        assert_eq!(server.try_recv(&mut buf).unwrap(), RecvOutcome::WouldBlock);
    }

    #[tokio::test]
    async fn test_eof_after_peer_drop() {
        let (client, server) = connected_pair().await;
        drop(client);

        server.recv_ready().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(server.try_recv(&mut buf).unwrap(), RecvOutcome::Eof);
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_io() {
        let (client, _server) = connected_pair().await;
        client.close();
        assert!(matches!(
            client.try_send(b"x"),
            Err(Error::NotConnected)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(client.try_recv(&mut buf), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_addrs_reported() {
        let (client, server) = connected_pair().await;
        assert_eq!(client.kind(), TransportKind::Stream);
        assert!(client.local_addr().is_some());
        assert!(server.peer_addr().is_some());
        assert!(!client.has_pending_data());
    }
}
