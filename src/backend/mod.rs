//! Transport backends.
//!
//! A [`Backend`] is the polymorphic seam between the connection core and a
//! concrete transport: TCP streams, local byte pipes, and hypervisor-guest
//! channels. The core never touches transport primitives directly; it
//! issues non-blocking reads/writes through this contract and parks on the
//! readiness futures in between.
//!
//! Contract: every non-async method is invoked with the owning
//! connection's lock already held. Implementations must not block and must
//! not call back into the connection. The readiness futures are awaited by
//! the connection driver *without* the lock held.

use async_trait::async_trait;

use crate::addr::{TransportAddr, TransportKind};
use crate::error::Result;

mod stream;
pub use stream::{StreamAcceptor, StreamBackend};

#[cfg(unix)]
mod pipe;
#[cfg(unix)]
pub use pipe::{PipeAcceptor, PipeBackend};

#[cfg(unix)]
mod guest;
#[cfg(unix)]
pub use guest::{GuestAcceptor, GuestBackend};

/// Result of a non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// `n` bytes were accepted by the transport.
    Sent(usize),
    /// The transport cannot accept bytes right now; this is the
    /// backpressure signal, not an error.
    WouldBlock,
}

/// Result of a non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes were read into the buffer.
    Read(usize),
    /// No bytes are available right now.
    WouldBlock,
    /// The peer closed its end of the transport.
    Eof,
}

/// Duplex transport operations behind a connected [`Connection`](crate::Connection).
#[async_trait]
pub trait Backend: Send + Sync {
    /// The transport kind this backend implements.
    fn kind(&self) -> TransportKind;

    /// Attempt a non-blocking write of `buf`.
    ///
    /// # Errors
    ///
    /// Transport failure, or [`Error::NotConnected`](crate::Error::NotConnected)
    /// after [`close`](Self::close).
    fn try_send(&self, buf: &[u8]) -> Result<SendOutcome>;

    /// Attempt a non-blocking read into `buf`.
    ///
    /// # Errors
    ///
    /// Transport failure, or [`Error::NotConnected`](crate::Error::NotConnected)
    /// after [`close`](Self::close).
    fn try_recv(&self, buf: &mut [u8]) -> Result<RecvOutcome>;

    /// Resolve when the transport is writable again.
    async fn send_ready(&self) -> Result<()>;

    /// Resolve when the transport has bytes to read.
    async fn recv_ready(&self) -> Result<()>;

    /// Whether bytes are already buffered inside the backend and readable
    /// without a new readiness event. Plain kernel transports return
    /// `false`; a record-layer wrapper (e.g. TLS) would return `true`
    /// while decrypted bytes remain buffered.
    fn has_pending_data(&self) -> bool;

    /// Local endpoint address, if known.
    fn local_addr(&self) -> Option<TransportAddr>;

    /// Peer endpoint address, if known.
    fn peer_addr(&self) -> Option<TransportAddr>;

    /// Close hook: called exactly once at teardown, with the connection
    /// lock held. Marks the backend unusable; the underlying descriptor
    /// is released when the backend is dropped.
    fn close(&self);
}

/// Passive-open half of the transport seam.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// The transport kind this acceptor implements.
    fn kind(&self) -> TransportKind;

    /// Wait for and accept one inbound connection.
    ///
    /// # Errors
    ///
    /// Transport failure on the listening endpoint.
    async fn accept(&self) -> Result<(Box<dyn Backend>, TransportAddr)>;

    /// Local listening address, if known.
    fn local_addr(&self) -> Option<TransportAddr>;

    /// Close hook: called exactly once at teardown, with the connection
    /// lock held.
    fn close(&self);
}

/// Translate a non-blocking io result into a [`SendOutcome`].
pub(crate) fn map_send(res: std::io::Result<usize>) -> Result<SendOutcome> {
    match res {
        Ok(n) => Ok(SendOutcome::Sent(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// Translate a non-blocking io result into a [`RecvOutcome`].
pub(crate) fn map_recv(res: std::io::Result<usize>) -> Result<RecvOutcome> {
    match res {
        Ok(0) => Ok(RecvOutcome::Eof),
        Ok(n) => Ok(RecvOutcome::Read(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
        Err(e) => Err(e.into()),
    }
}
