//! Streaming HyBi (RFC 6455) frame codec.
//!
//! The decoder is a state machine fed from a raw socket buffer filled by
//! arbitrary partial reads. Payload bytes flow through a two-buffer
//! pipeline: wire bytes accumulate in the socket buffer, and decoded
//! application bytes accumulate in a separate decode buffer from which the
//! application consumes. Under the `base64` sub-protocol the step between
//! the two buffers base64-decodes whole 4-character groups; under the
//! `binary` sub-protocol payload bytes pass straight through after
//! unmasking. Each buffer is a [`BytesMut`], whose consumed-prefix /
//! written-suffix structure is exactly the read-cursor ≤ write-cursor ≤
//! capacity invariant, with compaction on reserve.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::mask::{CyclicMask, MaskKeyGen, MaskPolicy, apply_mask};
use crate::error::{Error, Result};

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Classification of a data frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Raw binary payload (opcode 0x2).
    Binary,
    /// UTF-8 text payload (opcode 0x1).
    Text,
}

/// Payload transport negotiated through the sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Payload bytes pass through unchanged.
    #[default]
    Binary,
    /// Payload is base64-encoded and carried in text frames.
    Base64,
}

impl WireFormat {
    /// The Sec-WebSocket-Protocol token for this format.
    #[must_use]
    pub const fn token(&self) -> &'static str {
        match self {
            WireFormat::Binary => "binary",
            WireFormat::Base64 => "base64",
        }
    }

    /// Map a Sec-WebSocket-Protocol token to a wire format.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "binary" => Some(WireFormat::Binary),
            "base64" => Some(WireFormat::Base64),
            _ => None,
        }
    }
}

/// Control frames surfaced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Peer close frame with its optional status code.
    Close(Option<u16>),
    /// Peer ping with its application payload; must be answered with a pong.
    Ping(Bytes),
    /// Peer pong; informational only.
    Pong,
}

/// Decoder state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NeedFrameType,
    NeedFrameSize,
    NeedExtendedFrameSize,
    NeedFrameMask,
    NeedFrameData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameClass {
    Data(FrameKind),
    Close,
    Ping,
    Pong,
}

impl FrameClass {
    const fn is_control(self) -> bool {
        !matches!(self, FrameClass::Data(_))
    }
}

/// Streaming frame decoder.
///
/// Feed raw wire bytes into the socket buffer, then call
/// [`decode`](Self::decode); decoded application bytes land in the decode
/// buffer and control frames are reported as [`ControlEvent`]s. The
/// decoder holds all mid-frame state (remaining byte count, mask key and
/// cyclic offset), so input may be fragmented at any byte boundary.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    policy: MaskPolicy,
    wire: WireFormat,
    max_frame: usize,
    max_buffer: usize,
    class: FrameClass,
    current_frame_type: Option<FrameKind>,
    remaining: u64,
    frame_masked: bool,
    ext_len_bytes: usize,
    mask: Option<CyclicMask>,
    control_buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder for one direction of a session.
    #[must_use]
    pub fn new(policy: MaskPolicy, wire: WireFormat, max_frame: usize, max_buffer: usize) -> Self {
        Self {
            state: DecodeState::NeedFrameType,
            policy,
            wire,
            max_frame,
            max_buffer,
            class: FrameClass::Data(FrameKind::Binary),
            current_frame_type: None,
            remaining: 0,
            frame_masked: false,
            ext_len_bytes: 0,
            mask: None,
            control_buf: Vec::new(),
        }
    }

    /// Classification of the most recent data frame.
    #[must_use]
    pub const fn current_frame_type(&self) -> Option<FrameKind> {
        self.current_frame_type
    }

    /// True while the decoder is mid-frame.
    #[must_use]
    pub const fn mid_frame(&self) -> bool {
        !matches!(self.state, DecodeState::NeedFrameType)
    }

    /// Run the state machine over whatever `socket_buf` currently holds.
    ///
    /// Consumes as many wire bytes as possible, appends decoded
    /// application bytes to `decode_buf`, and pushes control frames onto
    /// `events`. Returns normally when more input is needed.
    ///
    /// # Errors
    ///
    /// Protocol errors (invalid opcode, masking policy violation,
    /// fragmentation, malformed base64) and capacity errors (frame or
    /// buffer bound exceeded). After an error the decoder state is
    /// unspecified; the session must be torn down.
    pub fn decode(
        &mut self,
        socket_buf: &mut BytesMut,
        decode_buf: &mut BytesMut,
        events: &mut Vec<ControlEvent>,
    ) -> Result<()> {
        loop {
            match self.state {
                DecodeState::NeedFrameType => {
                    if socket_buf.is_empty() {
                        break;
                    }
                    let byte0 = socket_buf.get_u8();
                    let fin = byte0 & 0x80 != 0;
                    if byte0 & 0x70 != 0 {
                        return Err(Error::ReservedBitsSet);
                    }
                    let opcode = byte0 & 0x0F;
                    self.class = match opcode {
                        0x1 => FrameClass::Data(FrameKind::Text),
                        0x2 => FrameClass::Data(FrameKind::Binary),
                        0x8 => FrameClass::Close,
                        0x9 => FrameClass::Ping,
                        0xA => FrameClass::Pong,
                        // Continuation frames imply fragmentation, which
                        // this codec does not reassemble.
                        0x0 => return Err(Error::FragmentedFrame),
                        other => return Err(Error::InvalidOpcode(other)),
                    };
                    if !fin {
                        return Err(Error::FragmentedFrame);
                    }
                    if let FrameClass::Data(kind) = self.class {
                        self.current_frame_type = Some(kind);
                    }
                    self.state = DecodeState::NeedFrameSize;
                }

                DecodeState::NeedFrameSize => {
                    if socket_buf.is_empty() {
                        break;
                    }
                    let byte1 = socket_buf.get_u8();
                    self.frame_masked = byte1 & 0x80 != 0;
                    if self.policy.requires_mask_on_recv() && !self.frame_masked {
                        return Err(Error::MissingMask);
                    }
                    if !self.policy.requires_mask_on_recv() && self.frame_masked {
                        return Err(Error::UnexpectedMask);
                    }
                    let len7 = byte1 & 0x7F;
                    if self.class.is_control() && len7 as usize > MAX_CONTROL_FRAME_PAYLOAD {
                        return Err(Error::ControlFrameTooLarge(len7 as usize));
                    }
                    match len7 {
                        126 => {
                            self.ext_len_bytes = 2;
                            self.state = DecodeState::NeedExtendedFrameSize;
                        }
                        127 => {
                            self.ext_len_bytes = 8;
                            self.state = DecodeState::NeedExtendedFrameSize;
                        }
                        n => self.begin_payload(u64::from(n), decode_buf, events)?,
                    }
                }

                DecodeState::NeedExtendedFrameSize => {
                    if socket_buf.len() < self.ext_len_bytes {
                        break;
                    }
                    let len = if self.ext_len_bytes == 2 {
                        u64::from(socket_buf.get_u16())
                    } else {
                        socket_buf.get_u64()
                    };
                    self.begin_payload(len, decode_buf, events)?;
                }

                DecodeState::NeedFrameMask => {
                    if socket_buf.len() < 4 {
                        break;
                    }
                    let mut key = [0u8; 4];
                    key.copy_from_slice(&socket_buf[..4]);
                    socket_buf.advance(4);
                    self.mask = Some(CyclicMask::new(key));
                    self.start_data(decode_buf, events)?;
                }

                DecodeState::NeedFrameData => {
                    if socket_buf.is_empty() {
                        break;
                    }
                    // Bounded by the buffer length, so the cast is lossless.
                    let mut take = self.remaining.min(socket_buf.len() as u64) as usize;
                    // Base64 groups decode only when whole; hold partial
                    // groups in the socket buffer until the frame delivers
                    // the rest.
                    if self.base64_data_frame() && (take as u64) < self.remaining {
                        take -= take % 4;
                        if take == 0 {
                            break;
                        }
                    }
                    let mut chunk = socket_buf.split_to(take);
                    if let Some(mask) = self.mask.as_mut() {
                        mask.apply(&mut chunk);
                    }
                    self.remaining -= take as u64;
                    self.route_payload(&chunk.freeze(), decode_buf)?;
                    if self.remaining == 0 {
                        self.finish_frame(decode_buf, events)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Record the frame length and move past the size states.
    fn begin_payload(
        &mut self,
        len: u64,
        decode_buf: &mut BytesMut,
        events: &mut Vec<ControlEvent>,
    ) -> Result<()> {
        if let FrameClass::Data(kind) = self.class {
            if len > self.max_frame as u64 {
                return Err(Error::FrameTooLarge {
                    size: usize::try_from(len).unwrap_or(usize::MAX),
                    max: self.max_frame,
                });
            }
            if self.wire == WireFormat::Base64 {
                if kind == FrameKind::Binary {
                    return Err(Error::ProtocolViolation(
                        "binary frame on base64 sub-protocol".into(),
                    ));
                }
                if len % 4 != 0 {
                    return Err(Error::InvalidBase64);
                }
            }
        }
        self.remaining = len;
        if self.frame_masked {
            self.state = DecodeState::NeedFrameMask;
            Ok(())
        } else {
            self.mask = None;
            self.start_data(decode_buf, events)
        }
    }

    /// Enter the payload state, completing zero-length frames immediately.
    fn start_data(
        &mut self,
        decode_buf: &mut BytesMut,
        events: &mut Vec<ControlEvent>,
    ) -> Result<()> {
        if self.remaining == 0 {
            self.finish_frame(decode_buf, events)
        } else {
            self.state = DecodeState::NeedFrameData;
            Ok(())
        }
    }

    fn route_payload(&mut self, chunk: &Bytes, decode_buf: &mut BytesMut) -> Result<()> {
        match self.class {
            FrameClass::Data(_) => {
                match self.wire {
                    WireFormat::Binary => decode_buf.extend_from_slice(chunk),
                    WireFormat::Base64 => {
                        let decoded = BASE64.decode(chunk).map_err(|_| Error::InvalidBase64)?;
                        decode_buf.extend_from_slice(&decoded);
                    }
                }
                self.check_decode_buf(decode_buf)?;
            }
            FrameClass::Close | FrameClass::Ping | FrameClass::Pong => {
                self.control_buf.extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    fn check_decode_buf(&self, decode_buf: &BytesMut) -> Result<()> {
        if decode_buf.len() > self.max_buffer {
            return Err(Error::BufferLimit {
                size: decode_buf.len(),
                max: self.max_buffer,
            });
        }
        Ok(())
    }

    fn finish_frame(
        &mut self,
        _decode_buf: &mut BytesMut,
        events: &mut Vec<ControlEvent>,
    ) -> Result<()> {
        match self.class {
            FrameClass::Data(_) => {}
            FrameClass::Close => {
                let code = if self.control_buf.len() >= 2 {
                    Some(u16::from_be_bytes([self.control_buf[0], self.control_buf[1]]))
                } else {
                    None
                };
                events.push(ControlEvent::Close(code));
                self.control_buf.clear();
            }
            FrameClass::Ping => {
                events.push(ControlEvent::Ping(Bytes::copy_from_slice(&self.control_buf)));
                self.control_buf.clear();
            }
            FrameClass::Pong => {
                events.push(ControlEvent::Pong);
                self.control_buf.clear();
            }
        }
        self.mask = None;
        self.state = DecodeState::NeedFrameType;
        Ok(())
    }

    fn base64_data_frame(&self) -> bool {
        matches!(self.class, FrameClass::Data(_)) && self.wire == WireFormat::Base64
    }
}

/// Frame encoder for the send direction of a session.
#[derive(Debug)]
pub struct FrameEncoder {
    policy: MaskPolicy,
    wire: WireFormat,
    keygen: MaskKeyGen,
}

impl FrameEncoder {
    /// Create an encoder whose masking follows `policy` and whose payload
    /// transport follows `wire`.
    ///
    /// # Errors
    ///
    /// Fails only if the entropy source for mask keys is unavailable.
    pub fn new(policy: MaskPolicy, wire: WireFormat) -> Result<Self> {
        Ok(Self {
            policy,
            wire,
            keygen: MaskKeyGen::new()?,
        })
    }

    /// Encode a data frame, base64-wrapping the payload when negotiated.
    #[must_use]
    pub fn encode_data(&mut self, kind: FrameKind, payload: &[u8]) -> Bytes {
        match self.wire {
            WireFormat::Binary => {
                let opcode = match kind {
                    FrameKind::Text => 0x1,
                    FrameKind::Binary => 0x2,
                };
                self.encode_raw(opcode, payload)
            }
            WireFormat::Base64 => {
                let encoded = BASE64.encode(payload);
                self.encode_raw(0x1, encoded.as_bytes())
            }
        }
    }

    /// Encode a close frame with an optional status code.
    #[must_use]
    pub fn encode_close(&mut self, code: Option<u16>) -> Bytes {
        let payload = code.map(|c| c.to_be_bytes().to_vec()).unwrap_or_default();
        self.encode_raw(0x8, &payload)
    }

    /// Encode a ping frame.
    #[must_use]
    pub fn encode_ping(&mut self, payload: &[u8]) -> Bytes {
        self.encode_raw(0x9, payload)
    }

    /// Encode a pong frame echoing a ping payload.
    #[must_use]
    pub fn encode_pong(&mut self, payload: &[u8]) -> Bytes {
        self.encode_raw(0xA, payload)
    }

    fn encode_raw(&mut self, opcode: u8, payload: &[u8]) -> Bytes {
        let masked = self.policy.requires_mask_on_send();
        let mut buf = BytesMut::with_capacity(14 + payload.len());
        buf.put_u8(0x80 | opcode);

        let mask_bit: u8 = if masked { 0x80 } else { 0 };
        match payload.len() {
            0..=125 => buf.put_u8(mask_bit | payload.len() as u8),
            126..=65535 => {
                buf.put_u8(mask_bit | 126);
                buf.put_u16(payload.len() as u16);
            }
            _ => {
                buf.put_u8(mask_bit | 127);
                buf.put_u64(payload.len() as u64);
            }
        }

        if masked {
            let key = self.keygen.next_key();
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        } else {
            buf.put_slice(payload);
        }
        buf.freeze()
    }
}
