//! Transport kinds and addresses.
//!
//! Addresses are carried opaquely by the connection core and interpreted
//! only by the matching backend.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Tag identifying which transport backend a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP stream socket.
    Stream,
    /// Local byte pipe (Unix domain socket).
    Pipe,
    /// Hypervisor-guest channel, carried over the hypervisor's host-side
    /// bridge endpoint.
    Guest,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Pipe => write!(f, "pipe"),
            TransportKind::Guest => write!(f, "guest"),
        }
    }
}

/// A transport endpoint address.
///
/// Guest channels are addressed by the hypervisor bridge socket plus a
/// numeric port, following the host-side convention of carrying guest
/// connections over `<bridge>_<port>` endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddr {
    /// IPv4/IPv6 socket address.
    Stream(SocketAddr),
    /// Filesystem path of a local pipe.
    Pipe(PathBuf),
    /// Hypervisor bridge endpoint and guest port.
    Guest {
        /// Path of the hypervisor's bridge socket.
        bridge: PathBuf,
        /// Guest port number.
        port: u32,
    },
}

impl TransportAddr {
    /// The transport kind this address belongs to.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            TransportAddr::Stream(_) => TransportKind::Stream,
            TransportAddr::Pipe(_) => TransportKind::Pipe,
            TransportAddr::Guest { .. } => TransportKind::Guest,
        }
    }
}

impl std::fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddr::Stream(sa) => write!(f, "{sa}"),
            TransportAddr::Pipe(path) => write!(f, "{}", path.display()),
            TransportAddr::Guest { bridge, port } => {
                write!(f, "{}:{port}", bridge.display())
            }
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(sa: SocketAddr) -> Self {
        TransportAddr::Stream(sa)
    }
}
