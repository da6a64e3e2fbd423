//! # asock - Asynchronous Multi-Transport Connection Layer
//!
//! `asock` multiplexes several transport backends (TCP streams, local
//! byte pipes, and hypervisor-guest channels) behind one callback-driven
//! connection abstraction, with an RFC 6455 WebSocket implementation
//! layered on top.
//!
//! ## Features
//!
//! - **One interface, three transports** behind a polymorphic backend seam
//! - **Callback-driven I/O**: length-targeted receives with
//!   fire-on-partial delivery, strictly ordered send completions
//! - **Cancellation-safe lifetime**: closing a connection from inside its
//!   own callbacks is always safe
//! - **Streaming WebSocket codec** that reassembles frames from arbitrary
//!   partial reads, with masking and an optional base64 sub-protocol
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use asock::{Config, Connection, TransportKind};
//!
//! let conn = Connection::create(TransportKind::Stream, Config::default())?;
//! conn.connect_async("127.0.0.1:9000".parse::<std::net::SocketAddr>()?.into(),
//!     Box::new(|c| {
//!         c.send(bytes::Bytes::from_static(b"hello"), None).unwrap();
//!     }))?;
//! ```

pub mod addr;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod websocket;

pub use addr::{TransportAddr, TransportKind};
pub use config::{Config, Limits};
pub use connection::{
    AcceptFn, ConnectFn, Connection, ConnectionGuard, ErrorFn, Phase, RecvEvent, RecvFn, SendFn,
};
pub use error::{Error, ErrorClass, Result};
pub use websocket::{FrameKind, SessionState, WebSocket, WireFormat};
