//! WebSocket protocol layer (RFC 6455).
//!
//! Layers an HTTP-style upgrade handshake and a streaming HyBi frame
//! codec over a [`Connection`](crate::Connection). A session is embedded
//! in its owning connection and shares that connection's lock and
//! lifetime.
//!
//! ## Example
//!
//! ```rust,ignore
//! use asock::{Connection, Config, TransportKind};
//! use asock::websocket::{WebSocket, FrameKind};
//!
//! // Server side, inside the accept callback:
//! WebSocket::accept(&conn, Box::new(|ws| {
//!     ws.send(FrameKind::Text, b"welcome", None).unwrap();
//! }))?;
//! ```

pub mod codec;
pub mod handshake;
pub mod mask;
mod session;
mod state;

pub use codec::{
    ControlEvent, FrameDecoder, FrameEncoder, FrameKind, MAX_CONTROL_FRAME_PAYLOAD, WireFormat,
};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, WS_GUID, WS_VERSION, compute_accept_key,
    constant_time_eq, find_header_end, generate_nonce,
};
pub use mask::{CyclicMask, MaskPolicy, apply_mask};
pub use session::{HandshakeInfo, OpenFn, UpgradeRequest, WebSocket, WsRecvFn};
pub use state::SessionState;

pub(crate) use session::Session;
