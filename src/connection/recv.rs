//! Receive pipeline state.

use bytes::BytesMut;

use super::RecvFn;

/// Accumulates inbound bytes for the single outstanding receive
/// registration.
///
/// `buf` holds bytes pulled from the transport but not yet delivered;
/// `scratch` is the reusable chunk the transport reads into. The buffer
/// never holds more than the registered target, so a request of length N
/// pulls at most N bytes off the transport.
pub(crate) struct RecvPipeline {
    pub(crate) buf: BytesMut,
    pub(crate) scratch: Box<[u8]>,
    pub(crate) target: usize,
    pub(crate) fire_on_partial: bool,
    pub(crate) on_data: Option<RecvFn>,
}

impl RecvPipeline {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scratch: vec![0u8; chunk_size.max(1)].into_boxed_slice(),
            target: 0,
            fire_on_partial: false,
            on_data: None,
        }
    }

    /// Whether a registration is outstanding.
    pub(crate) fn armed(&self) -> bool {
        self.on_data.is_some()
    }

    /// Install a registration, replacing (and cancelling) any unfired one.
    /// Already-buffered bytes are preserved for the new registration.
    pub(crate) fn arm(&mut self, target: usize, fire_on_partial: bool, on_data: RecvFn) {
        self.target = target;
        self.fire_on_partial = fire_on_partial;
        self.on_data = Some(on_data);
    }

    /// Drop the registration without firing; buffered bytes survive.
    pub(crate) fn cancel(&mut self) {
        self.on_data = None;
    }

    /// Take the callback out for a delivery, clearing the registration.
    pub(crate) fn take_callback(&mut self) -> Option<RecvFn> {
        self.on_data.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> RecvFn {
        Box::new(|_, _| {})
    }

    #[test]
    fn test_arm_and_cancel() {
        let mut recv = RecvPipeline::new(4096);
        assert!(!recv.armed());

        recv.arm(128, false, noop());
        assert!(recv.armed());
        assert_eq!(recv.target, 128);

        recv.cancel();
        assert!(!recv.armed());
    }

    #[test]
    fn test_rearm_replaces_registration() {
        let mut recv = RecvPipeline::new(4096);
        recv.buf.extend_from_slice(b"leftover");

        recv.arm(100, false, noop());
        recv.arm(4, true, noop());

        assert_eq!(recv.target, 4);
        assert!(recv.fire_on_partial);
        // Replacing the registration never discards buffered bytes.
        assert_eq!(&recv.buf[..], b"leftover");
    }

    #[test]
    fn test_scratch_is_at_least_one_byte() {
        let recv = RecvPipeline::new(0);
        assert_eq!(recv.scratch.len(), 1);
    }
}
