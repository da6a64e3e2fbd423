//! Send pipeline state.

use std::collections::VecDeque;

use bytes::Bytes;

use super::SendFn;

/// One queued outbound buffer and its completion callback.
pub(crate) struct PendingSend {
    pub(crate) data: Bytes,
    pub(crate) on_sent: Option<SendFn>,
}

/// Strict-FIFO queue of outbound buffers.
///
/// `head_sent` tracks how many bytes of the head node have been written;
/// a node is dequeued and its callback fired only once its full length is
/// on the wire, so completions fire in enqueue order. `blocked` is the
/// queue-full backpressure condition: raised when the transport reports
/// it would block, cleared by the next writability event, which is the
/// sole trigger for retrying the head.
pub(crate) struct SendPipeline {
    pub(crate) queue: VecDeque<PendingSend>,
    pub(crate) head_sent: usize,
    pub(crate) blocked: bool,
}

impl SendPipeline {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            head_sent: 0,
            blocked: false,
        }
    }

    /// Append a node; returns whether the queue was empty beforehand.
    pub(crate) fn push(&mut self, node: PendingSend) -> bool {
        let was_empty = self.queue.is_empty();
        self.queue.push_back(node);
        was_empty
    }

    /// Total bytes not yet written to the transport.
    pub(crate) fn pending_bytes(&self) -> usize {
        let queued: usize = self.queue.iter().map(|n| n.data.len()).sum();
        queued - self.head_sent
    }

    /// Drop all nodes without firing their callbacks.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.head_sent = 0;
        self.blocked = false;
    }
}
