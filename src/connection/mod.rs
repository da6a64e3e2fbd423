//! Connection core: lifecycle, pipelines, and the readiness driver.
//!
//! A [`Connection`] is a cloneable handle to shared per-connection state
//! guarded by a single reentrant lock. All user callbacks are delivered
//! with that lock held, so a callback may freely call back into the
//! connection, including closing it. Lifetime is ownership-tracked: the
//! shared state is freed when the last handle drops, and the transient
//! strong handle held during dispatch keeps a connection alive while one
//! of its own callbacks is on the stack.
//!
//! ## Receive semantics
//!
//! [`Connection::request_recv`] registers the single outstanding receive.
//! The engine accumulates bytes until the requested length is buffered and
//! fires once with exactly that many bytes; in fire-on-partial mode the
//! callback instead fires on every arrival with whatever is buffered and
//! must re-register if it wants more. Bytes left over from a completed or
//! replaced registration stay buffered for the next one.
//!
//! ## Send semantics
//!
//! [`Connection::send`] appends to a FIFO of pending buffers. Completion
//! callbacks fire strictly in enqueue order, each only after its buffer
//! has been fully written to the transport. When the transport signals it
//! would block, the queue parks until the poller reports writability
//! again; that writability event is the sole retry trigger.

mod driver;
mod handle;
mod recv;
mod send;

pub use handle::{Connection, ConnectionGuard, Phase};
pub(crate) use handle::{Binding, Core, Shared};

use bytes::Bytes;

use crate::error::Error;

/// Payload delivered to a receive callback.
#[derive(Debug, Clone)]
pub enum RecvEvent {
    /// The registered length was reached; carries exactly that many bytes.
    Complete(Bytes),
    /// Fire-on-partial delivery; carries everything buffered so far.
    Partial(Bytes),
}

impl RecvEvent {
    /// The delivered bytes.
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        match self {
            RecvEvent::Complete(b) | RecvEvent::Partial(b) => b,
        }
    }

    /// Take ownership of the delivered bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            RecvEvent::Complete(b) | RecvEvent::Partial(b) => b,
        }
    }

    /// Whether this delivery completed the registered length.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, RecvEvent::Complete(_))
    }
}

/// Receive callback: invoked with the connection lock held.
pub type RecvFn = Box<dyn FnMut(&Connection, RecvEvent) + Send>;

/// Send completion callback: invoked once the buffer has been fully
/// transmitted, with the connection lock held.
pub type SendFn = Box<dyn FnOnce(&Connection) + Send>;

/// Connect completion callback: invoked exactly once on success; a failed
/// connect reports through the error callback instead, never both.
pub type ConnectFn = Box<dyn FnOnce(&Connection) + Send>;

/// Accept callback: invoked once per accepted peer with a freshly created,
/// already-connected [`Connection`].
pub type AcceptFn = Box<dyn FnMut(Connection) + Send>;

/// Error callback: invoked at most once per connection, after which the
/// connection is unusable.
pub type ErrorFn = Box<dyn FnOnce(&Connection, Error) + Send>;
