//! Error types for the connection layer and WebSocket protocol.
//!
//! Errors fall into four classes: transport failures reported by a backend,
//! protocol violations detected while parsing the handshake or frame stream,
//! capacity overruns against configured limits, and state errors from
//! operations attempted on a connection that can no longer perform them.
//! Backpressure is deliberately *not* an error; it is signaled through
//! [`SendOutcome::WouldBlock`](crate::backend::SendOutcome).

use thiserror::Error;

/// Result type alias for connection and WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], mirroring the error-handling
/// policy: transport and protocol errors poison the connection, capacity
/// errors reject the offending payload, state errors reject the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// I/O failure reported by the transport backend.
    Transport,
    /// Malformed handshake or frame stream.
    Protocol,
    /// A configured limit was exceeded.
    Capacity,
    /// Operation not valid for the connection's current lifecycle state.
    State,
}

/// Errors that can occur during connection and WebSocket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// I/O error reported by the transport backend.
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer closed the transport while data was still expected.
    #[error("Unexpected end of stream")]
    Eof,

    /// Operation attempted on a connection that is not connected, has
    /// already failed, or has been closed.
    #[error("Not connected")]
    NotConnected,

    /// The address kind does not match the connection's transport kind.
    #[error("Address kind does not match transport kind")]
    AddressKindMismatch,

    /// Operation attempted in the wrong lifecycle phase.
    #[error("Invalid lifecycle phase: {0}")]
    InvalidPhase(&'static str),

    /// Invalid WebSocket handshake.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Handshake header block exceeds the configured maximum.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Accumulated header size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame opcode is not recognized by the codec.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Fragmented frames are not supported by the streaming codec.
    #[error("Fragmented frame")]
    FragmentedFrame,

    /// Reserved header bits set without a negotiated extension.
    #[error("Reserved bits set")]
    ReservedBitsSet,

    /// The masking policy requires a mask on this direction but the frame
    /// carries none.
    #[error("Frame missing required mask")]
    MissingMask,

    /// The masking policy forbids a mask on this direction but the frame
    /// carries one.
    #[error("Frame carries unexpected mask")]
    UnexpectedMask,

    /// Control frame payload exceeds the 125-byte protocol limit.
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Frame payload exceeds the configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A connection buffer would exceed the configured bound.
    #[error("Buffer limit exceeded: {size} bytes (max: {max})")]
    BufferLimit {
        /// Required buffer size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Payload under the base64 sub-protocol is not valid base64.
    #[error("Invalid base64 payload")]
    InvalidBase64,

    /// Generic protocol violation.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl Error {
    /// Classify this error per the error-handling policy.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Error::Io(_) | Error::Eof => ErrorClass::Transport,
            Error::InvalidHandshake(_)
            | Error::InvalidOpcode(_)
            | Error::FragmentedFrame
            | Error::ReservedBitsSet
            | Error::MissingMask
            | Error::UnexpectedMask
            | Error::ControlFrameTooLarge(_)
            | Error::InvalidBase64
            | Error::ProtocolViolation(_) => ErrorClass::Protocol,
            Error::HandshakeTooLarge { .. }
            | Error::FrameTooLarge { .. }
            | Error::BufferLimit { .. } => ErrorClass::Capacity,
            Error::NotConnected | Error::AddressKindMismatch | Error::InvalidPhase(_) => {
                ErrorClass::State
            }
        }
    }

    /// Whether this error permanently poisons the connection once reported.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Transport | ErrorClass::Protocol)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::FrameTooLarge {
            size: 20_000_000,
            max: 16_000_000,
        };
        assert_eq!(
            err.to_string(),
            "Frame too large: 20000000 bytes (max: 16000000)"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::Eof.class(), ErrorClass::Transport);
        assert_eq!(Error::InvalidOpcode(0x3).class(), ErrorClass::Protocol);
        assert_eq!(
            Error::HandshakeTooLarge {
                size: 9000,
                max: 8192
            }
            .class(),
            ErrorClass::Capacity
        );
        assert_eq!(Error::NotConnected.class(), ErrorClass::State);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Io("reset".into()).is_fatal());
        assert!(Error::MissingMask.is_fatal());
        assert!(!Error::NotConnected.is_fatal());
        assert!(!Error::BufferLimit { size: 10, max: 5 }.is_fatal());
    }

    #[test]
    fn test_error_clone() {
        let err = Error::InvalidHandshake("missing version".into());
        assert_eq!(err.clone(), err);
    }
}
