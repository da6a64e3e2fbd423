//! Hypervisor-guest channel backend.
//!
//! Guest channels are carried over the hypervisor's host-side bridge
//! endpoint, a Unix socket speaking a one-line connect preamble:
//!
//! ```text
//! host → bridge:  CONNECT <port>\n
//! bridge → host:  OK <assigned-port>\n
//! ```
//!
//! After the preamble the stream is a plain reliable byte channel to the
//! guest. Inbound guest connections surface on a per-port listening
//! endpoint named `<bridge>_<port>`, which the acceptor binds directly.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, trace};

use super::{Acceptor, Backend, RecvOutcome, SendOutcome, map_recv, map_send};
use crate::addr::{TransportAddr, TransportKind};
use crate::error::{Error, Result};

const MAX_PREAMBLE_LINE: usize = 64;

/// The listening endpoint path for guest-initiated connections to `port`.
fn listen_path(bridge: &Path, port: u32) -> PathBuf {
    let mut os: OsString = bridge.as_os_str().to_os_string();
    os.push(format!("_{port}"));
    PathBuf::from(os)
}

/// Duplex guest-channel backend.
pub struct GuestBackend {
    stream: UnixStream,
    addr: TransportAddr,
    closed: AtomicBool,
}

impl GuestBackend {
    fn from_stream(stream: UnixStream, bridge: &Path, port: u32) -> Self {
        Self {
            stream,
            addr: TransportAddr::Guest {
                bridge: bridge.to_path_buf(),
                port,
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Connect to guest `port` through the bridge endpoint.
    ///
    /// # Errors
    ///
    /// Transport failure on the bridge socket, or a protocol violation if
    /// the bridge refuses the port.
    pub async fn connect(bridge: &Path, port: u32) -> Result<Self> {
        let mut stream = UnixStream::connect(bridge).await?;
        stream
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await?;

        let mut line = Vec::with_capacity(16);
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(Error::Eof);
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_PREAMBLE_LINE {
                return Err(Error::ProtocolViolation("bridge preamble too long".into()));
            }
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| Error::ProtocolViolation("bridge preamble not UTF-8".into()))?;
        if !text.starts_with("OK ") {
            return Err(Error::ProtocolViolation(format!(
                "bridge refused connection: {text}"
            )));
        }

        trace!(bridge = %bridge.display(), port, "guest backend connected");
        Ok(Self::from_stream(stream, bridge, port))
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
impl Backend for GuestBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Guest
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
        Some(self.addr.clone())
    }

    fn peer_addr(&self) -> Option<TransportAddr> {
        Some(self.addr.clone())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("guest backend closed");
    }
}

/// Guest-channel listening backend for one port.
pub struct GuestAcceptor {
    listener: UnixListener,
    bridge: PathBuf,
    port: u32,
    closed: AtomicBool,
}

impl GuestAcceptor {
    /// Listen for guest-initiated connections to `port`.
    ///
    /// Binds the per-port endpoint `<bridge>_<port>`. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Bind failure on the per-port endpoint.
    pub fn bind(bridge: &Path, port: u32) -> Result<Self> {
        let path = listen_path(bridge, port);
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), port, "guest acceptor bound");
        Ok(Self {
            listener,
            bridge: bridge.to_path_buf(),
            port,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Acceptor for GuestAcceptor {
    fn kind(&self) -> TransportKind {
        TransportKind::Guest
    }

    async fn accept(&self) -> Result<(Box<dyn Backend>, TransportAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let (stream, _) = self.listener.accept().await?;
        trace!(port = self.port, "guest acceptor accepted peer");
        let addr = TransportAddr::Guest {
            bridge: self.bridge.clone(),
            port: self.port,
        };
        Ok((
            Box::new(GuestBackend::from_stream(stream, &self.bridge, self.port)),
            addr,
        ))
    }

    fn local_addr(&self) -> Option<TransportAddr> {
        Some(TransportAddr::Guest {
            bridge: self.bridge.clone(),
            port: self.port,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!(port = self.port, "guest acceptor closed");
    }
}
