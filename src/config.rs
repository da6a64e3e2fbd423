//! Configuration and limits for connections.

use std::time::Duration;

/// Resource limits for a connection.
///
/// These bounds keep memory usage finite under sustained streaming and
/// reject oversized protocol elements before buffering them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum declared payload size of a single WebSocket frame in bytes.
    ///
    /// Default: 16 MB (16 * 1024 * 1024)
    pub max_frame_size: usize,

    /// Maximum size of the WebSocket handshake header block in bytes.
    ///
    /// Default: 8 KB (8192)
    pub max_handshake_size: usize,

    /// Maximum size any single connection buffer (receive accumulation,
    /// raw socket buffer, decoded application buffer) may grow to.
    ///
    /// Default: 64 MB (64 * 1024 * 1024)
    pub max_buffer_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_handshake_size: 8192,
            max_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl Limits {
    /// Create new limits with custom values.
    #[must_use]
    pub const fn new(max_frame_size: usize, max_handshake_size: usize, max_buffer_size: usize) -> Self {
        Self {
            max_frame_size,
            max_handshake_size,
            max_buffer_size,
        }
    }

    /// Limits suitable for small embedded deployments.
    ///
    /// - Max frame: 64 KB
    /// - Max handshake: 4 KB
    /// - Max buffer: 256 KB
    #[must_use]
    pub const fn embedded() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            max_handshake_size: 4096,
            max_buffer_size: 256 * 1024,
        }
    }

    /// Validate a declared frame size against the limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`](crate::Error::FrameTooLarge) if `size`
    /// exceeds the configured maximum.
    pub const fn check_frame_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_frame_size {
            Err(crate::Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate an accumulated handshake size against the limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeTooLarge`](crate::Error::HandshakeTooLarge)
    /// if `size` exceeds the configured maximum.
    pub const fn check_handshake_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_handshake_size {
            Err(crate::Error::HandshakeTooLarge {
                size,
                max: self.max_handshake_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate a buffer size against the limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferLimit`](crate::Error::BufferLimit) if `size`
    /// exceeds the configured maximum.
    pub const fn check_buffer_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_buffer_size {
            Err(crate::Error::BufferLimit {
                size,
                max: self.max_buffer_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resource limits.
    pub limits: Limits,

    /// Size of the scratch chunk used when pulling bytes from the
    /// transport (in bytes).
    ///
    /// Default: 8 KB (8192)
    pub recv_chunk_size: usize,

    /// Bound on the drain wait in [`Connection::flush`](crate::Connection::flush).
    ///
    /// Default: 5 seconds
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            recv_chunk_size: 8192,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new configuration with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the transport pull chunk size.
    #[must_use]
    pub const fn with_recv_chunk_size(mut self, size: usize) -> Self {
        self.recv_chunk_size = size;
        self
    }

    /// Set the drain timeout bound.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
