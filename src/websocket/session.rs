//! WebSocket session lifecycle over a [`Connection`].
//!
//! A session is embedded in its owning connection and shares the
//! connection's lock; it cannot outlive it. Upgrading registers a
//! fire-on-partial receive that pumps raw bytes first through the
//! handshake accumulator and then through the streaming frame decoder,
//! delivering decoded application bytes to the session-level receive
//! registration.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::codec::{ControlEvent, FrameDecoder, FrameEncoder, FrameKind, WireFormat};
use super::handshake::{HandshakeRequest, HandshakeResponse, find_header_end, generate_nonce};
use super::mask::MaskPolicy;
use super::state::SessionState;
use crate::connection::{Connection, Phase, RecvEvent, SendFn};
use crate::error::{Error, Result};

/// Open-completion callback: fires exactly once when the session reaches
/// `Open`, with the connection lock held. Handshake failures report
/// through the connection's error callback instead; the session never
/// half-opens.
pub type OpenFn = Box<dyn FnOnce(&WebSocket) + Send>;

/// Session-level receive callback over decoded application bytes.
pub type WsRecvFn = Box<dyn FnMut(&WebSocket, RecvEvent) + Send>;

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// Handshake fields captured when the session opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Origin header, if the peer sent one.
    pub origin: Option<String>,
    /// Host header as sent.
    pub host: String,
    /// Host with any `:port` suffix removed.
    pub hostname: String,
    /// Negotiated sub-protocol token, if any.
    pub protocol: Option<String>,
    /// Request URI.
    pub uri: String,
    /// Cookie header, if the peer sent one.
    pub cookie: Option<String>,
    /// Protocol version from the handshake.
    pub version: u8,
}

/// Client-side upgrade parameters.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request URI (e.g. `/channel`).
    pub uri: String,
    /// Host header value.
    pub host: String,
    /// Origin header, if any.
    pub origin: Option<String>,
    /// Cookie header, if any.
    pub cookie: Option<String>,
    /// Sub-protocol tokens to offer, in preference order.
    pub protocols: Vec<String>,
}

impl UpgradeRequest {
    /// Upgrade parameters for `uri` against `host`, offering the binary
    /// sub-protocol.
    #[must_use]
    pub fn new(uri: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            host: host.into(),
            origin: None,
            cookie: None,
            protocols: vec![WireFormat::Binary.token().to_string()],
        }
    }

    /// Set the Origin header.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the Cookie header.
    #[must_use]
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Replace the offered sub-protocols.
    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }
}

struct AppRecv {
    target: usize,
    fire_on_partial: bool,
    on_data: WsRecvFn,
}

/// Per-session state, embedded in the owning connection's core.
pub(crate) struct Session {
    pub(crate) info: HandshakeInfo,
    pub(crate) state: SessionState,
    role: Role,
    wire: WireFormat,
    decoder: Option<FrameDecoder>,
    encoder: Option<FrameEncoder>,
    /// Raw wire bytes not yet consumed by the decoder.
    socket_buf: BytesMut,
    /// Decoded application bytes not yet consumed by the caller.
    decode_buf: BytesMut,
    /// Header-block accumulation while `Connecting`.
    handshake_buf: BytesMut,
    /// Client upgrade nonce awaiting its echo.
    nonce: Option<String>,
    /// Sub-protocols the client offered.
    offered: Vec<String>,
    on_open: Option<OpenFn>,
    app_recv: Option<AppRecv>,
    app_dispatching: bool,
    close_sent: bool,
}

impl Session {
    fn new(role: Role, on_open: OpenFn) -> Self {
        Self {
            info: HandshakeInfo::default(),
            state: SessionState::Connecting,
            role,
            wire: WireFormat::Binary,
            decoder: None,
            encoder: None,
            socket_buf: BytesMut::new(),
            decode_buf: BytesMut::new(),
            handshake_buf: BytesMut::new(),
            nonce: None,
            offered: Vec::new(),
            on_open: Some(on_open),
            app_recv: None,
            app_dispatching: false,
            close_sent: false,
        }
    }
}

/// A WebSocket session handle over an upgraded [`Connection`].
#[derive(Clone)]
pub struct WebSocket {
    conn: Connection,
}

impl WebSocket {
    /// Server-side upgrade: parse the peer's handshake from `conn` and
    /// promote it into an open session.
    ///
    /// `on_open` fires once the handshake completes; a failed handshake
    /// reports through the connection's error callback and closes the
    /// connection without ever dispatching `on_open`.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if `conn` is not connected, or
    /// [`Error::InvalidPhase`] if it already carries a session.
    pub fn accept(conn: &Connection, on_open: OpenFn) -> Result<()> {
        install_session(conn, Session::new(Role::Server, on_open))?;
        debug!(id = conn.id(), "websocket server handshake started");
        arm_pump(conn)
    }

    /// Client-side upgrade: send the upgrade request on `conn` and
    /// validate the server's response.
    ///
    /// The generated upgrade nonce is validated against the server's echo
    /// with a constant-time comparison.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] / [`Error::InvalidPhase`] as for
    /// [`accept`](Self::accept), or a handshake serialization failure.
    pub fn connect(conn: &Connection, request: UpgradeRequest, on_open: OpenFn) -> Result<()> {
        let nonce = generate_nonce()?;
        let hs = HandshakeRequest {
            uri: request.uri.clone(),
            hostname: super::handshake::hostname_of(&request.host),
            host: request.host.clone(),
            origin: request.origin.clone(),
            cookie: request.cookie.clone(),
            key: nonce.clone(),
            version: super::handshake::WS_VERSION,
            protocols: request.protocols.clone(),
        };
        let mut buf = Vec::new();
        hs.write(&mut buf)?;

        let mut session = Session::new(Role::Client, on_open);
        session.nonce = Some(nonce);
        session.offered = request.protocols;
        session.info = HandshakeInfo {
            origin: request.origin,
            hostname: hs.hostname.clone(),
            host: request.host,
            protocol: None,
            uri: request.uri,
            cookie: request.cookie,
            version: super::handshake::WS_VERSION,
        };
        install_session(conn, session)?;
        debug!(id = conn.id(), "websocket client handshake started");

        conn.send(Bytes::from(buf), None)?;
        arm_pump(conn)
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.conn
            .with_core(|core| core.ws.as_ref().map(|ws| ws.state))
            .unwrap_or(SessionState::Closed)
    }

    /// Handshake fields captured at open.
    #[must_use]
    pub fn info(&self) -> HandshakeInfo {
        self.conn
            .with_core(|core| core.ws.as_ref().map(|ws| ws.info.clone()))
            .unwrap_or_default()
    }

    /// Negotiated sub-protocol token, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.conn
            .with_core(|core| core.ws.as_ref().and_then(|ws| ws.info.protocol.clone()))
    }

    /// Send an application payload as one frame.
    ///
    /// The payload is masked and base64-wrapped as the session's policy
    /// and negotiated sub-protocol require; the encoded copy is produced
    /// here, at enqueue time. `on_sent` fires once the frame is fully on
    /// the wire.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] unless the session is `Open`.
    pub fn send(&self, kind: FrameKind, payload: &[u8], on_sent: Option<SendFn>) -> Result<()> {
        let frame = self.conn.with_core(|core| -> Result<Bytes> {
            let Some(ws) = core.ws.as_mut() else {
                return Err(Error::NotConnected);
            };
            if !ws.state.can_send() {
                return Err(Error::NotConnected);
            }
            let Some(encoder) = ws.encoder.as_mut() else {
                return Err(Error::NotConnected);
            };
            Ok(encoder.encode_data(kind, payload))
        })?;
        self.conn.send(frame, on_sent)
    }

    /// Register the session-level receive over decoded application bytes.
    ///
    /// Semantics mirror [`Connection::request_recv`]: accumulate `len`
    /// decoded bytes and fire once, or fire on every decoded arrival in
    /// fire-on-partial mode; one registration outstanding at a time, with
    /// leftovers preserved across registrations.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] once the session is past `Closing`, or
    /// [`Error::BufferLimit`] if `len` exceeds the buffer bound.
    pub fn request_recv(&self, len: usize, fire_on_partial: bool, on_data: WsRecvFn) -> Result<()> {
        let in_dispatch = self.conn.with_core(|core| -> Result<bool> {
            let limits = core.config.limits.clone();
            let Some(ws) = core.ws.as_mut() else {
                return Err(Error::NotConnected);
            };
            if !ws.state.can_receive() {
                return Err(Error::NotConnected);
            }
            limits.check_buffer_size(len)?;
            ws.app_recv = Some(AppRecv {
                target: len,
                fire_on_partial,
                on_data,
            });
            Ok(ws.app_dispatching)
        })?;
        if !in_dispatch {
            deliver_app(&self.conn);
        }
        Ok(())
    }

    /// Initiate the close handshake.
    ///
    /// Sends a close frame and moves the session to `Closing`; the
    /// connection closes once the peer echoes. Closing an already-closing
    /// session is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if the session is gone.
    pub fn close(&self, code: Option<u16>) -> Result<()> {
        let frame = self.conn.with_core(|core| -> Result<Option<Bytes>> {
            let Some(ws) = core.ws.as_mut() else {
                return Err(Error::NotConnected);
            };
            if !ws.state.can_send() {
                return Ok(None);
            }
            ws.close_sent = true;
            ws.state.advance(SessionState::Closing);
            Ok(ws.encoder.as_mut().map(|e| e.encode_close(code)))
        })?;
        if let Some(frame) = frame {
            self.conn.send(frame, None)?;
        }
        Ok(())
    }
}

fn install_session(conn: &Connection, session: Session) -> Result<()> {
    conn.with_core(|core| -> Result<()> {
        if core.phase != Phase::Connected {
            return Err(Error::NotConnected);
        }
        if core.ws.is_some() {
            return Err(Error::InvalidPhase("connection already carries a websocket session"));
        }
        core.ws = Some(session);
        Ok(())
    })
}

/// Arm the raw-byte pump on the underlying connection.
fn arm_pump(conn: &Connection) -> Result<()> {
    let chunk = conn.with_core(|core| core.config.recv_chunk_size);
    conn.request_recv(chunk, true, Box::new(pump_callback))
}

fn pump_callback(conn: &Connection, ev: RecvEvent) {
    pump(conn, ev.into_bytes());
    let alive = conn.with_core(|core| {
        core.phase == Phase::Connected
            && core.ws.as_ref().is_some_and(|ws| !ws.state.is_closed())
    });
    if alive {
        let _ = arm_pump(conn);
    }
}

enum PumpStep {
    Handshake,
    Frames,
    Dead,
}

/// Feed raw bytes into the session. Runs with the connection lock held
/// (the pump is invoked from receive dispatch).
fn pump(conn: &Connection, bytes: Bytes) {
    let step = conn.with_core(|core| {
        let Some(ws) = core.ws.as_mut() else {
            return PumpStep::Dead;
        };
        match ws.state {
            SessionState::Connecting => {
                ws.handshake_buf.extend_from_slice(&bytes);
                PumpStep::Handshake
            }
            SessionState::Open | SessionState::Closing => {
                ws.socket_buf.extend_from_slice(&bytes);
                PumpStep::Frames
            }
            SessionState::Closed => PumpStep::Dead,
        }
    });
    match step {
        PumpStep::Handshake => pump_handshake(conn),
        PumpStep::Frames => pump_frames(conn),
        PumpStep::Dead => {}
    }
}

enum HandshakeStep {
    Wait,
    Fail(Error),
    Complete { role: Role, header: Bytes },
}

fn pump_handshake(conn: &Connection) {
    let step = conn.with_core(|core| {
        let limits = core.config.limits.clone();
        let Some(ws) = core.ws.as_mut() else {
            return HandshakeStep::Wait;
        };
        if let Err(e) = limits.check_handshake_size(ws.handshake_buf.len()) {
            return HandshakeStep::Fail(e);
        }
        match find_header_end(&ws.handshake_buf) {
            None => HandshakeStep::Wait,
            Some(end) => {
                let header = ws.handshake_buf.split_to(end).freeze();
                // Bytes past the header block are already frame data.
                let remainder = ws.handshake_buf.split();
                ws.socket_buf.extend_from_slice(&remainder);
                HandshakeStep::Complete {
                    role: ws.role,
                    header,
                }
            }
        }
    });

    match step {
        HandshakeStep::Wait => {}
        HandshakeStep::Fail(e) => fail_session(conn, e),
        HandshakeStep::Complete { role, header } => {
            let result = match role {
                Role::Server => finish_server_handshake(conn, &header),
                Role::Client => finish_client_handshake(conn, &header),
            };
            match result {
                Ok(response) => {
                    if let Some(response) = response {
                        if let Err(e) = conn.send(response, None) {
                            fail_session(conn, e);
                            return;
                        }
                    }
                    let on_open = conn.with_core(|core| {
                        core.ws.as_mut().and_then(|ws| {
                            if ws.state.advance(SessionState::Open) {
                                ws.on_open.take()
                            } else {
                                None
                            }
                        })
                    });
                    debug!(id = conn.id(), "websocket session open");
                    if let Some(f) = on_open {
                        f(&WebSocket { conn: conn.clone() });
                    }
                    // The handshake may have arrived glued to the first
                    // frames.
                    pump_frames(conn);
                }
                Err(e) => fail_session(conn, e),
            }
        }
    }
}

/// Parse and answer the client's upgrade request. Returns the 101
/// response to send.
fn finish_server_handshake(conn: &Connection, header: &[u8]) -> Result<Option<Bytes>> {
    let req = HandshakeRequest::parse(header)?;
    req.validate()?;

    // First offer we recognize wins; no recognized offer means raw binary
    // with no token echoed.
    let wire = req.protocols.iter().find_map(|t| WireFormat::from_token(t));
    let token = wire.map(|w| w.token().to_string());
    let wire = wire.unwrap_or_default();

    let response = HandshakeResponse::from_request(&req, token.clone());
    let mut buf = Vec::new();
    response.write(&mut buf)?;

    conn.with_core(|core| -> Result<()> {
        let limits = core.config.limits.clone();
        let Some(ws) = core.ws.as_mut() else {
            return Err(Error::NotConnected);
        };
        ws.info = HandshakeInfo {
            origin: req.origin.clone(),
            hostname: req.hostname.clone(),
            host: req.host.clone(),
            protocol: token.clone(),
            uri: req.uri.clone(),
            cookie: req.cookie.clone(),
            version: req.version,
        };
        ws.wire = wire;
        ws.decoder = Some(FrameDecoder::new(
            MaskPolicy::server(),
            wire,
            limits.max_frame_size,
            limits.max_buffer_size,
        ));
        ws.encoder = Some(FrameEncoder::new(MaskPolicy::server(), wire)?);
        Ok(())
    })?;
    trace!(id = conn.id(), protocol = ?token, "server handshake complete");
    Ok(Some(Bytes::from(buf)))
}

/// Validate the server's upgrade response against our nonce.
fn finish_client_handshake(conn: &Connection, header: &[u8]) -> Result<Option<Bytes>> {
    let response = HandshakeResponse::parse(header)?;

    let (nonce, offered) = conn.with_core(|core| {
        core.ws
            .as_mut()
            .map(|ws| (ws.nonce.take(), ws.offered.clone()))
            .unwrap_or((None, Vec::new()))
    });
    let nonce = nonce.ok_or_else(|| Error::InvalidHandshake("no upgrade nonce outstanding".into()))?;
    response.validate_accept(&nonce)?;

    let wire = match &response.protocol {
        Some(token) => {
            if !offered.iter().any(|o| o == token) {
                return Err(Error::InvalidHandshake(format!(
                    "server selected unoffered protocol: {token}"
                )));
            }
            WireFormat::from_token(token).ok_or_else(|| {
                Error::InvalidHandshake(format!("server selected unknown protocol: {token}"))
            })?
        }
        None => WireFormat::Binary,
    };

    conn.with_core(|core| -> Result<()> {
        let limits = core.config.limits.clone();
        let Some(ws) = core.ws.as_mut() else {
            return Err(Error::NotConnected);
        };
        ws.info.protocol = response.protocol.clone();
        ws.wire = wire;
        ws.decoder = Some(FrameDecoder::new(
            MaskPolicy::client(),
            wire,
            limits.max_frame_size,
            limits.max_buffer_size,
        ));
        ws.encoder = Some(FrameEncoder::new(MaskPolicy::client(), wire)?);
        Ok(())
    })?;
    trace!(id = conn.id(), protocol = ?response.protocol, "client handshake complete");
    Ok(None)
}

/// Run the decoder over buffered wire bytes, answer control frames, and
/// deliver decoded bytes to the session-level registration.
fn pump_frames(conn: &Connection) {
    let outcome = conn.with_core(|core| -> Result<Vec<ControlEvent>> {
        let Some(ws) = core.ws.as_mut() else {
            return Ok(Vec::new());
        };
        if !ws.state.can_receive() {
            return Ok(Vec::new());
        }
        let Some(decoder) = ws.decoder.as_mut() else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        decoder.decode(&mut ws.socket_buf, &mut ws.decode_buf, &mut events)?;
        Ok(events)
    });

    match outcome {
        Err(e) => fail_session(conn, e),
        Ok(events) => {
            for event in events {
                handle_control(conn, event);
            }
            deliver_app(conn);
        }
    }
}

enum CloseAction {
    Echo(Bytes),
    JustClose,
    Nothing,
}

fn handle_control(conn: &Connection, event: ControlEvent) {
    match event {
        ControlEvent::Ping(payload) => {
            let pong = conn.with_core(|core| {
                core.ws.as_mut().and_then(|ws| {
                    if ws.state.can_receive() {
                        ws.encoder.as_mut().map(|e| e.encode_pong(&payload))
                    } else {
                        None
                    }
                })
            });
            if let Some(pong) = pong {
                let _ = conn.send(pong, None);
            }
        }
        ControlEvent::Pong => {
            trace!(id = conn.id(), "pong received");
        }
        ControlEvent::Close(code) => {
            debug!(id = conn.id(), ?code, "close frame received");
            let action = conn.with_core(|core| {
                let Some(ws) = core.ws.as_mut() else {
                    return CloseAction::Nothing;
                };
                let we_initiated = ws.close_sent;
                ws.state.advance(SessionState::Closing);
                ws.state.advance(SessionState::Closed);
                if we_initiated {
                    CloseAction::JustClose
                } else {
                    ws.close_sent = true;
                    match ws.encoder.as_mut() {
                        Some(e) => CloseAction::Echo(e.encode_close(code)),
                        None => CloseAction::JustClose,
                    }
                }
            });
            match action {
                CloseAction::Echo(frame) => {
                    // Close the transport only after the echo drains.
                    let _ = conn.send(frame, Some(Box::new(|c: &Connection| c.close())));
                }
                CloseAction::JustClose => conn.close(),
                CloseAction::Nothing => {}
            }
        }
    }
}

/// Fire the session-level registration from decoded bytes until nothing
/// more is satisfiable. Recursive registrations from inside the callback
/// arm only; this loop re-evaluates.
fn deliver_app(conn: &Connection) {
    let proceed = conn.with_core(|core| match core.ws.as_mut() {
        Some(ws) if !ws.app_dispatching => {
            ws.app_dispatching = true;
            true
        }
        _ => false,
    });
    if !proceed {
        return;
    }

    loop {
        let fire = conn.with_core(|core| {
            let ws = core.ws.as_mut()?;
            let reg = ws.app_recv.as_ref()?;
            let buffered = ws.decode_buf.len();
            if buffered >= reg.target {
                let target = reg.target;
                let data = ws.decode_buf.split_to(target).freeze();
                ws.app_recv.take().map(|r| (r.on_data, RecvEvent::Complete(data)))
            } else if reg.fire_on_partial && buffered > 0 {
                let data = ws.decode_buf.split_to(buffered).freeze();
                ws.app_recv.take().map(|r| (r.on_data, RecvEvent::Partial(data)))
            } else {
                None
            }
        });
        match fire {
            Some((mut cb, event)) => {
                let ws = WebSocket { conn: conn.clone() };
                cb(&ws, event);
            }
            None => break,
        }
    }

    conn.with_core(|core| {
        if let Some(ws) = core.ws.as_mut() {
            ws.app_dispatching = false;
        }
    });
}

/// Tear the session down on a handshake or protocol failure: the session
/// goes straight to `Closed` (never `Open`), the connection reports the
/// error once and closes.
fn fail_session(conn: &Connection, err: Error) {
    debug!(id = conn.id(), error = %err, "websocket session failed");
    conn.with_core(|core| {
        if let Some(ws) = core.ws.as_mut() {
            ws.state.advance(SessionState::Closed);
            ws.on_open = None;
            ws.app_recv = None;
        }
    });
    conn.report_error(err);
}
