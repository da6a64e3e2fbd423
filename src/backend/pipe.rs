//! Local byte-pipe backend (Unix domain sockets).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, trace};

use super::{Acceptor, Backend, RecvOutcome, SendOutcome, map_recv, map_send};
use crate::addr::{TransportAddr, TransportKind};
use crate::error::{Error, Result};

fn addr_of(path: Option<PathBuf>) -> Option<TransportAddr> {
    path.map(TransportAddr::Pipe)
}

fn path_of(addr: std::io::Result<tokio::net::unix::SocketAddr>) -> Option<PathBuf> {
    addr.ok()
        .and_then(|a| a.as_pathname().map(Path::to_path_buf))
}

/// Duplex pipe backend.
pub struct PipeBackend {
    stream: UnixStream,
    closed: AtomicBool,
}

impl PipeBackend {
    /// Wrap an already-connected pipe.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a connection to the pipe at `path`.
    ///
    /// # Errors
    ///
    /// Transport-level connect failure.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        trace!(path = %path.display(), "pipe backend connected");
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
impl Backend for PipeBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
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
        addr_of(path_of(self.stream.local_addr()))
    }

    fn peer_addr(&self) -> Option<TransportAddr> {
        addr_of(path_of(self.stream.peer_addr()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("pipe backend closed");
    }
}

/// Pipe listening backend.
pub struct PipeAcceptor {
    listener: UnixListener,
    path: PathBuf,
    closed: AtomicBool,
}

impl PipeAcceptor {
    /// Bind a listener at `path`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Bind failure (path exists, permissions, ...).
    pub fn bind(path: &Path) -> Result<Self> {
        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "pipe acceptor bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Acceptor for PipeAcceptor {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn accept(&self) -> Result<(Box<dyn Backend>, TransportAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let (stream, _) = self.listener.accept().await?;
        trace!(path = %self.path.display(), "pipe acceptor accepted peer");
        // Unnamed peer endpoints report the listening path.
        Ok((
            Box::new(PipeBackend::new(stream)),
            TransportAddr::Pipe(self.path.clone()),
        ))
    }

    fn local_addr(&self) -> Option<TransportAddr> {
        Some(TransportAddr::Pipe(self.path.clone()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!(path = %self.path.display(), "pipe acceptor closed");
    }
}
