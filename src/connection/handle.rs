//! The shared connection object and its operations.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::driver;
use super::recv::RecvPipeline;
use super::send::{PendingSend, SendPipeline};
use super::{AcceptFn, ConnectFn, ErrorFn, RecvEvent, RecvFn, SendFn};
use crate::addr::{TransportAddr, TransportKind};
use crate::backend::{Acceptor, Backend, RecvOutcome, SendOutcome, StreamAcceptor, StreamBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::websocket::SessionState;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Freshly created; no backend bound.
    Created,
    /// Passive open: listener bound, not yet accepting.
    Bound,
    /// Accepting peers.
    Listening,
    /// Non-blocking connect in flight.
    Connecting,
    /// Duplex backend bound; I/O available.
    Connected,
    /// A fatal error was reported; unusable.
    Failed,
    /// Explicitly closed; unusable.
    Closed,
}

impl Phase {
    /// Whether the connection can never perform I/O again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed | Phase::Closed)
    }
}

/// The active backend binding.
pub(crate) enum Binding {
    None,
    Duplex(Arc<dyn Backend>),
    Accept(Arc<dyn Acceptor>),
}

impl Binding {
    pub(crate) fn duplex(&self) -> Option<Arc<dyn Backend>> {
        match self {
            Binding::Duplex(b) => Some(b.clone()),
            _ => None,
        }
    }
}

/// All mutable connection state; lives behind the per-connection lock.
pub(crate) struct Core {
    pub(crate) phase: Phase,
    pub(crate) config: Config,
    pub(crate) binding: Binding,
    pub(crate) error_fn: Option<ErrorFn>,
    pub(crate) error_fired: bool,
    pub(crate) close_hook_run: bool,
    pub(crate) accept_fn: Option<AcceptFn>,
    pub(crate) recv: RecvPipeline,
    pub(crate) send: SendPipeline,
    pub(crate) ws: Option<crate::websocket::Session>,
    pub(crate) dispatch_depth: u32,
}

/// Run the backend close hook exactly once.
fn run_close_hook(core: &mut Core) {
    if core.close_hook_run {
        return;
    }
    core.close_hook_run = true;
    match &core.binding {
        Binding::Duplex(b) => b.close(),
        Binding::Accept(a) => a.close(),
        Binding::None => {}
    }
}

/// Shared allocation behind every [`Connection`] handle.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) kind: TransportKind,
    pub(crate) lock: ReentrantMutex<RefCell<Core>>,
    /// Kicks the driver when interest changes (registration, enqueue,
    /// close). Shared separately so the driver can outlive this
    /// allocation by a moment.
    pub(crate) wake: Arc<Notify>,
    /// Notified whenever the send queue fully drains.
    pub(crate) drained: Notify,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: the close hook runs here if nothing ran it
        // earlier, then the backend itself is released by the drop of the
        // binding. Hooks thus fire exactly once, in close-then-release
        // order.
        let core = self.lock.get_mut().get_mut();
        run_close_hook(core);
        core.binding = Binding::None;
        self.wake.notify_one();
    }
}

/// Cloneable handle to one asynchronous connection.
///
/// See the [module docs](crate::connection) for callback and lifetime
/// semantics. Dropping the last handle tears the connection down.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

/// Opaque guard proving the connection lock is held by this thread.
pub struct ConnectionGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<Core>>,
}

enum SendStep {
    Complete(Option<SendFn>),
    Progress,
    Stop,
    Fatal(Error),
}

enum PullStep {
    Progress,
    Stop,
    Fatal(Error),
}

impl Connection {
    /// Allocate a connection for `kind` with no backend bound.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` reserves room for backends with
    /// fallible setup.
    pub fn create(kind: TransportKind, config: Config) -> Result<Self> {
        Ok(Self::alloc(kind, config))
    }

    fn alloc(kind: TransportKind, config: Config) -> Self {
        let recv = RecvPipeline::new(config.recv_chunk_size);
        let core = Core {
            phase: Phase::Created,
            config,
            binding: Binding::None,
            error_fn: None,
            error_fired: false,
            close_hook_run: false,
            accept_fn: None,
            recv,
            send: SendPipeline::new(),
            ws: None,
            dispatch_depth: 0,
        };
        let shared = Arc::new(Shared {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            lock: ReentrantMutex::new(RefCell::new(core)),
            wake: Arc::new(Notify::new()),
            drained: Notify::new(),
        });
        debug!(id = shared.id, kind = %kind, "connection created");
        Self { shared }
    }

    /// Build an already-connected connection around `backend` and start
    /// its driver. Used for accepted peers and completed connects.
    pub(crate) fn new_connected(
        kind: TransportKind,
        config: Config,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let conn = Self::alloc(kind, config);
        {
            let guard = conn.shared.lock.lock();
            let mut core = guard.borrow_mut();
            core.binding = Binding::Duplex(backend);
            core.phase = Phase::Connected;
        }
        driver::spawn(&conn.shared);
        conn
    }

    /// Opaque connection id, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The transport kind this connection was created for.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        let guard = self.shared.lock.lock();
        let phase = guard.borrow().phase;
        phase
    }

    /// Number of live handles to this connection, including this one.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Acquire the connection lock explicitly.
    ///
    /// Every operation takes the lock internally; the explicit guard
    /// exists for callers that need several operations to be atomic with
    /// respect to callback dispatch. The lock is reentrant, so holding
    /// the guard and then calling connection methods is fine.
    #[must_use]
    pub fn lock(&self) -> ConnectionGuard<'_> {
        ConnectionGuard {
            _guard: self.shared.lock.lock(),
        }
    }

    /// Whether any thread currently holds the connection lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.lock.is_locked()
    }

    /// Register the error callback, replacing any previous one.
    pub fn set_error_handler(&self, on_error: ErrorFn) {
        let guard = self.shared.lock.lock();
        guard.borrow_mut().error_fn = Some(on_error);
    }

    /// Local endpoint address, if a backend is bound and knows it.
    #[must_use]
    pub fn local_addr(&self) -> Option<TransportAddr> {
        let guard = self.shared.lock.lock();
        let core = guard.borrow();
        match &core.binding {
            Binding::Duplex(b) => b.local_addr(),
            Binding::Accept(a) => a.local_addr(),
            Binding::None => None,
        }
    }

    /// Peer endpoint address, if connected.
    #[must_use]
    pub fn peer_addr(&self) -> Option<TransportAddr> {
        let guard = self.shared.lock.lock();
        let core = guard.borrow();
        match &core.binding {
            Binding::Duplex(b) => b.peer_addr(),
            _ => None,
        }
    }

    /// Bind the passive-open listener for `addr`.
    ///
    /// # Errors
    ///
    /// [`Error::AddressKindMismatch`] if the address kind differs from the
    /// connection's, [`Error::InvalidPhase`] outside the `Created` phase,
    /// or the transport bind failure.
    pub fn bind(&self, addr: &TransportAddr) -> Result<()> {
        if addr.kind() != self.shared.kind {
            return Err(Error::AddressKindMismatch);
        }
        let guard = self.shared.lock.lock();
        {
            let core = guard.borrow();
            if core.phase != Phase::Created {
                return Err(Error::InvalidPhase("bind requires a newly created connection"));
            }
        }
        let acceptor: Arc<dyn Acceptor> = match addr {
            TransportAddr::Stream(sa) => Arc::new(StreamAcceptor::bind(*sa)?),
            #[cfg(unix)]
            TransportAddr::Pipe(path) => Arc::new(crate::backend::PipeAcceptor::bind(path)?),
            #[cfg(unix)]
            TransportAddr::Guest { bridge, port } => {
                Arc::new(crate::backend::GuestAcceptor::bind(bridge, *port)?)
            }
            #[cfg(not(unix))]
            _ => return Err(Error::Io("transport not supported on this platform".into())),
        };
        let mut core = guard.borrow_mut();
        core.binding = Binding::Accept(acceptor);
        core.phase = Phase::Bound;
        debug!(id = self.shared.id, %addr, "connection bound");
        Ok(())
    }

    /// Start accepting peers, delivering each to `on_accept`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPhase`] if the connection is not bound.
    pub fn listen(&self, on_accept: AcceptFn) -> Result<()> {
        {
            let guard = self.shared.lock.lock();
            let mut core = guard.borrow_mut();
            if core.phase != Phase::Bound {
                return Err(Error::InvalidPhase("listen requires a bound connection"));
            }
            core.accept_fn = Some(on_accept);
            core.phase = Phase::Listening;
        }
        driver::spawn(&self.shared);
        self.shared.wake.notify_one();
        debug!(id = self.shared.id, "connection listening");
        Ok(())
    }

    /// Initiate a non-blocking connect to `addr`.
    ///
    /// Completion is reported exactly once: `on_connect` on success, the
    /// error callback on failure, never both. Closing the connection
    /// while the connect is in flight cancels the unfired callback.
    ///
    /// # Errors
    ///
    /// [`Error::AddressKindMismatch`] or [`Error::InvalidPhase`] for a
    /// connection that is not freshly created.
    pub fn connect_async(&self, addr: TransportAddr, on_connect: ConnectFn) -> Result<()> {
        if addr.kind() != self.shared.kind {
            return Err(Error::AddressKindMismatch);
        }
        {
            let guard = self.shared.lock.lock();
            let mut core = guard.borrow_mut();
            if core.phase != Phase::Created {
                return Err(Error::InvalidPhase("connect requires a newly created connection"));
            }
            core.phase = Phase::Connecting;
        }
        trace!(id = self.shared.id, %addr, "connect initiated");
        // The in-flight connect holds a strong handle: a pending
        // completion keeps the connection alive until delivered or
        // cancelled.
        let conn = self.clone();
        tokio::spawn(async move {
            let result = connect_backend(addr).await;
            conn.finish_connect(result, on_connect);
        });
        Ok(())
    }

    fn finish_connect(&self, result: Result<Arc<dyn Backend>>, on_connect: ConnectFn) {
        let guard = self.shared.lock.lock();
        {
            let core = guard.borrow();
            if core.phase != Phase::Connecting {
                trace!(id = self.shared.id, "connect completion after teardown; dropped");
                return;
            }
        }
        match result {
            Ok(backend) => {
                {
                    let mut core = guard.borrow_mut();
                    core.binding = Binding::Duplex(backend);
                    core.phase = Phase::Connected;
                }
                driver::spawn(&self.shared);
                debug!(id = self.shared.id, "connection established");
                on_connect(self);
                self.shared.wake.notify_one();
            }
            Err(e) => self.report_error(e),
        }
    }

    /// Register the single outstanding receive.
    ///
    /// Accumulates until `len` bytes are buffered, then fires once with
    /// exactly `len` bytes. With `fire_on_partial`, the callback fires on
    /// every arrival with whatever is buffered (consuming it) and must
    /// re-register for more. A new registration replaces an unfired one;
    /// bytes already buffered are never discarded and satisfy the new
    /// registration first.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] outside the `Connected` phase, or
    /// [`Error::BufferLimit`] if `len` exceeds the buffer bound.
    pub fn request_recv(&self, len: usize, fire_on_partial: bool, on_data: RecvFn) -> Result<()> {
        let guard = self.shared.lock.lock();
        let in_dispatch = {
            let mut core = guard.borrow_mut();
            if core.phase != Phase::Connected {
                return Err(Error::NotConnected);
            }
            core.config.limits.check_buffer_size(len)?;
            core.recv.arm(len, fire_on_partial, on_data);
            core.dispatch_depth > 0
        };
        self.shared.wake.notify_one();
        // A recursive registration from inside a receive callback only
        // arms; the outer dispatch loop re-evaluates fire conditions, so
        // one readiness event never double-dispatches.
        if !in_dispatch {
            self.run_recv_dispatch();
        }
        Ok(())
    }

    /// Cancel the outstanding receive registration, if any.
    ///
    /// Only the registration is cleared; accumulated bytes remain
    /// available to the next one. A callback already in progress is not
    /// affected.
    pub fn cancel_recv(&self) {
        let guard = self.shared.lock.lock();
        guard.borrow_mut().recv.cancel();
    }

    /// Queue `data` for transmission.
    ///
    /// If the queue was empty the transport write is attempted
    /// immediately. `on_sent` fires once the full buffer is on the wire;
    /// completions across nodes fire in enqueue order.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] outside the `Connected` phase.
    pub fn send(&self, data: Bytes, on_sent: Option<SendFn>) -> Result<()> {
        let guard = self.shared.lock.lock();
        let was_empty = {
            let mut core = guard.borrow_mut();
            if core.phase != Phase::Connected {
                return Err(Error::NotConnected);
            }
            core.send.push(PendingSend { data, on_sent })
        };
        if was_empty {
            self.run_send_dispatch();
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait for the send queue to drain, bounded by the configured drain
    /// timeout.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if the connection fails or closes while
    /// draining, or [`Error::Io`] on timeout.
    pub async fn flush(&self) -> Result<()> {
        let timeout = {
            let guard = self.shared.lock.lock();
            let t = guard.borrow().config.drain_timeout;
            t
        };
        let drain = async {
            loop {
                let notified = self.shared.drained.notified();
                tokio::pin!(notified);
                // Register interest before inspecting the queue so a
                // drain on another thread cannot slip between the check
                // and the await.
                notified.as_mut().enable();
                {
                    let guard = self.shared.lock.lock();
                    let core = guard.borrow();
                    if core.send.queue.is_empty() {
                        return Ok(());
                    }
                    if core.phase.is_terminal() {
                        return Err(Error::NotConnected);
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| Error::Io("drain timed out".to_string()))?
    }

    /// Report a fatal error.
    ///
    /// The registered error callback fires at most once per connection;
    /// afterwards every I/O operation fails with
    /// [`Error::NotConnected`] instead of touching the transport.
    pub fn report_error(&self, err: Error) {
        let guard = self.shared.lock.lock();
        let cb = {
            let mut core = guard.borrow_mut();
            if core.phase.is_terminal() {
                None
            } else {
                warn!(id = self.shared.id, error = %err, "connection failed");
                core.phase = Phase::Failed;
                core.recv.cancel();
                core.accept_fn = None;
                if let Some(ws) = core.ws.as_mut() {
                    ws.state.advance(SessionState::Closed);
                }
                run_close_hook(&mut core);
                if core.error_fired {
                    None
                } else {
                    core.error_fired = true;
                    core.error_fn.take()
                }
            }
        };
        if let Some(f) = cb {
            f(self, err);
        }
        self.shared.wake.notify_one();
        self.shared.drained.notify_waiters();
    }

    /// Cooperatively tear the connection down.
    ///
    /// Unfired receive/send/accept callbacks are cancelled, the backend
    /// close hook runs exactly once, and the driver retires. Callbacks
    /// already on the stack complete normally; the memory they use stays
    /// alive through the handles those frames hold.
    pub fn close(&self) {
        let guard = self.shared.lock.lock();
        {
            let mut core = guard.borrow_mut();
            if core.phase == Phase::Closed {
                return;
            }
            debug!(id = self.shared.id, "connection closed");
            run_close_hook(&mut core);
            core.phase = Phase::Closed;
            core.recv.cancel();
            core.accept_fn = None;
            core.error_fn = None;
            core.send.clear();
            if let Some(ws) = core.ws.as_mut() {
                ws.state.advance(SessionState::Closed);
            }
            core.binding = Binding::None;
        }
        self.shared.wake.notify_one();
        self.shared.drained.notify_waiters();
    }

    /// Run `f` with the core borrowed under the connection lock.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let guard = self.shared.lock.lock();
        let mut core = guard.borrow_mut();
        f(&mut core)
    }

    // ---------------------------------------------------------------
    // Dispatch (driver entry points)
    // ---------------------------------------------------------------

    /// Readiness hook: the transport became readable.
    pub(crate) fn on_recv_ready(&self) {
        self.run_recv_dispatch();
    }

    /// Readiness hook: the transport became writable. Writability is the
    /// sole event that clears the queue-full condition and retries the
    /// head of the queue.
    pub(crate) fn on_send_ready(&self) {
        {
            let guard = self.shared.lock.lock();
            guard.borrow_mut().send.blocked = false;
        }
        self.run_send_dispatch();
    }

    /// Accept dispatch: wrap the backend in a fresh connection and hand
    /// it to the accept callback.
    pub(crate) fn dispatch_accept(&self, backend: Box<dyn Backend>, peer: TransportAddr) {
        let guard = self.shared.lock.lock();
        let action = {
            let mut core = guard.borrow_mut();
            if core.phase == Phase::Listening {
                let config = core.config.clone();
                core.accept_fn.take().map(|cb| (cb, config))
            } else {
                None
            }
        };
        let Some((mut cb, config)) = action else {
            return;
        };
        trace!(id = self.shared.id, %peer, "accepted peer");
        let child = Connection::new_connected(self.shared.kind, config, Arc::from(backend));
        cb(child);
        // The callback stays registered across accepts unless it
        // installed a replacement itself.
        let mut core = guard.borrow_mut();
        if core.accept_fn.is_none() && core.phase == Phase::Listening {
            core.accept_fn = Some(cb);
        }
    }

    /// The receive loop: fire what buffered bytes satisfy, then pull more
    /// from the transport, until nothing progresses.
    fn run_recv_dispatch(&self) {
        let guard = self.shared.lock.lock();
        {
            let mut core = guard.borrow_mut();
            if core.dispatch_depth > 0 || core.phase.is_terminal() {
                return;
            }
            core.dispatch_depth += 1;
        }
        let mut fatal: Option<Error> = None;
        'dispatch: loop {
            // Fire phase: deliver buffered bytes while any registration
            // is satisfiable. Callbacks may re-register; the loop
            // re-evaluates after each delivery.
            loop {
                let fire = {
                    let mut core = guard.borrow_mut();
                    if !core.recv.armed() {
                        None
                    } else {
                        let buffered = core.recv.buf.len();
                        if buffered >= core.recv.target {
                            let target = core.recv.target;
                            let data = core.recv.buf.split_to(target).freeze();
                            core.recv.take_callback().map(|cb| (cb, RecvEvent::Complete(data)))
                        } else if core.recv.fire_on_partial && buffered > 0 {
                            let data = core.recv.buf.split_to(buffered).freeze();
                            core.recv.take_callback().map(|cb| (cb, RecvEvent::Partial(data)))
                        } else {
                            None
                        }
                    }
                };
                match fire {
                    Some((mut cb, event)) => cb(self, event),
                    None => break,
                }
            }

            // Pull phase: read what the transport has, bounded by the
            // outstanding request length.
            let pull = {
                let mut core = guard.borrow_mut();
                if !core.recv.armed() || core.phase != Phase::Connected {
                    PullStep::Stop
                } else if let Some(backend) = core.binding.duplex() {
                    let want = core.recv.target.saturating_sub(core.recv.buf.len());
                    let n = want.min(core.recv.scratch.len());
                    if n == 0 {
                        PullStep::Stop
                    } else {
                        match backend.try_recv(&mut core.recv.scratch[..n]) {
                            Ok(RecvOutcome::Read(k)) => {
                                let recv = &mut core.recv;
                                recv.buf.extend_from_slice(&recv.scratch[..k]);
                                PullStep::Progress
                            }
                            Ok(RecvOutcome::WouldBlock) => PullStep::Stop,
                            Ok(RecvOutcome::Eof) => PullStep::Fatal(Error::Eof),
                            Err(e) => PullStep::Fatal(e),
                        }
                    }
                } else {
                    PullStep::Stop
                }
            };
            match pull {
                PullStep::Progress => continue 'dispatch,
                PullStep::Stop => break,
                PullStep::Fatal(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        {
            guard.borrow_mut().dispatch_depth -= 1;
        }
        if let Some(e) = fatal {
            self.report_error(e);
        }
    }

    /// The send loop: write the head of the queue until it blocks, fails,
    /// or the queue drains, firing completions in order.
    fn run_send_dispatch(&self) {
        let guard = self.shared.lock.lock();
        let mut fatal: Option<Error> = None;
        loop {
            let step = {
                let mut core = guard.borrow_mut();
                if core.phase != Phase::Connected || core.send.blocked {
                    SendStep::Stop
                } else {
                    match core.send.queue.front().map(|h| (h.data.clone(), core.send.head_sent)) {
                        None => SendStep::Stop,
                        Some((data, sent)) if sent >= data.len() => {
                            let node = core.send.queue.pop_front();
                            core.send.head_sent = 0;
                            SendStep::Complete(node.and_then(|n| n.on_sent))
                        }
                        Some((data, sent)) => {
                            if let Some(backend) = core.binding.duplex() {
                                match backend.try_send(&data[sent..]) {
                                    Ok(SendOutcome::Sent(0)) | Ok(SendOutcome::WouldBlock) => {
                                        core.send.blocked = true;
                                        SendStep::Stop
                                    }
                                    Ok(SendOutcome::Sent(n)) => {
                                        core.send.head_sent += n;
                                        SendStep::Progress
                                    }
                                    Err(e) => SendStep::Fatal(e),
                                }
                            } else {
                                SendStep::Stop
                            }
                        }
                    }
                }
            };
            match step {
                SendStep::Complete(cb) => {
                    if let Some(cb) = cb {
                        cb(self);
                    }
                }
                SendStep::Progress => {}
                SendStep::Stop => break,
                SendStep::Fatal(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        let empty = {
            let core = guard.borrow();
            core.send.queue.is_empty()
        };
        if empty {
            self.shared.drained.notify_waiters();
        }
        self.shared.wake.notify_one();
        if let Some(e) = fatal {
            self.report_error(e);
        }
    }
}

/// Open the duplex backend for `addr`.
async fn connect_backend(addr: TransportAddr) -> Result<Arc<dyn Backend>> {
    match addr {
        TransportAddr::Stream(sa) => Ok(Arc::new(StreamBackend::connect(sa).await?)),
        #[cfg(unix)]
        TransportAddr::Pipe(path) => {
            Ok(Arc::new(crate::backend::PipeBackend::connect(&path).await?))
        }
        #[cfg(unix)]
        TransportAddr::Guest { bridge, port } => Ok(Arc::new(
            crate::backend::GuestBackend::connect(&bridge, port).await?,
        )),
        #[cfg(not(unix))]
        _ => Err(Error::Io("transport not supported on this platform".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Scripted in-memory backend: reads come from queued chunks, writes
    /// are captured and rationed by a byte budget, readiness futures park
    /// forever so tests drive dispatch by hand.
    struct MockBackend {
        rx: Mutex<VecDeque<Vec<u8>>>,
        eof: Mutex<bool>,
        written: Mutex<Vec<u8>>,
        write_budget: Mutex<usize>,
        write_cap: usize,
        close_calls: Arc<AtomicUsize>,
        release_calls: Arc<AtomicUsize>,
    }

    impl MockBackend {
        fn new(write_cap: usize) -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(VecDeque::new()),
                eof: Mutex::new(false),
                written: Mutex::new(Vec::new()),
                write_budget: Mutex::new(usize::MAX),
                write_cap,
                close_calls: Arc::new(AtomicUsize::new(0)),
                release_calls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn push_rx(&self, data: &[u8]) {
            self.rx.lock().push_back(data.to_vec());
        }

        fn set_eof(&self) {
            *self.eof.lock() = true;
        }

        fn set_write_budget(&self, budget: usize) {
            *self.write_budget.lock() = budget;
        }

        fn written(&self) -> Vec<u8> {
            self.written.lock().clone()
        }
    }

    impl Drop for MockBackend {
        fn drop(&mut self) {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }

        fn try_send(&self, buf: &[u8]) -> Result<SendOutcome> {
            let mut budget = self.write_budget.lock();
            if *budget == 0 {
                return Ok(SendOutcome::WouldBlock);
            }
            let n = buf.len().min(self.write_cap).min(*budget);
            *budget -= n;
            self.written.lock().extend_from_slice(&buf[..n]);
            Ok(SendOutcome::Sent(n))
        }

        fn try_recv(&self, buf: &mut [u8]) -> Result<RecvOutcome> {
            let mut rx = self.rx.lock();
            match rx.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n == chunk.len() {
                        rx.pop_front();
                    } else {
                        chunk.drain(..n);
                    }
                    Ok(RecvOutcome::Read(n))
                }
                None if *self.eof.lock() => Ok(RecvOutcome::Eof),
                None => Ok(RecvOutcome::WouldBlock),
            }
        }

        async fn send_ready(&self) -> Result<()> {
            std::future::pending().await
        }

        async fn recv_ready(&self) -> Result<()> {
            std::future::pending().await
        }

        fn has_pending_data(&self) -> bool {
            false
        }

        fn local_addr(&self) -> Option<TransportAddr> {
            None
        }

        fn peer_addr(&self) -> Option<TransportAddr> {
            None
        }

        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mock_conn(write_cap: usize) -> (Connection, Arc<MockBackend>) {
        let mock = MockBackend::new(write_cap);
        let backend: Arc<dyn Backend> = mock.clone();
        let conn = Connection::new_connected(TransportKind::Stream, Config::default(), backend);
        (conn, mock)
    }

    #[tokio::test]
    async fn test_recv_fires_once_with_exact_length() {
        let (conn, mock) = mock_conn(64);
        let got: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = got.clone();
        conn.request_recv(
            5,
            false,
            Box::new(move |_, ev| {
                assert!(ev.is_complete());
                sink.lock().push(ev.into_bytes());
            }),
        )
        .unwrap();

        // Deliver 8 bytes across two chunks; the registration wants 5.
        mock.push_rx(b"hel");
        conn.on_recv_ready();
        assert!(got.lock().is_empty());

        mock.push_rx(b"lo+++");
        conn.on_recv_ready();

        let fired = got.lock();
        assert_eq!(fired.len(), 1);
        assert_eq!(&fired[0][..], b"hello");
    }

    #[tokio::test]
    async fn test_leftover_bytes_satisfy_next_registration() {
        let (conn, mock) = mock_conn(64);

        let first: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let sink = first.clone();
        conn.request_recv(
            2,
            false,
            Box::new(move |_, ev| {
                *sink.lock() = Some(ev.into_bytes());
            }),
        )
        .unwrap();

        mock.push_rx(b"ab");
        conn.on_recv_ready();
        assert_eq!(first.lock().as_deref(), Some(b"ab".as_ref()));

        // 3 more bytes arrive with no registration armed... they stay in
        // the transport. Re-register for 3 and deliver.
        mock.push_rx(b"cde");
        let second: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let sink = second.clone();
        conn.request_recv(
            3,
            false,
            Box::new(move |_, ev| {
                *sink.lock() = Some(ev.into_bytes());
            }),
        )
        .unwrap();
        conn.on_recv_ready();
        assert_eq!(second.lock().as_deref(), Some(b"cde".as_ref()));
    }

    #[tokio::test]
    async fn test_smaller_request_leaves_leftovers_buffered() {
        let (conn, mock) = mock_conn(64);

        // Arm for 10, deliver only 6, then replace the registration with
        // one for 4: it must fire immediately from buffered bytes and
        // leave the remainder.
        conn.request_recv(10, false, Box::new(|_, _| panic!("must not fire"))).unwrap();
        mock.push_rx(b"abcdef");
        conn.on_recv_ready();

        let got: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let sink = got.clone();
        conn.request_recv(
            4,
            false,
            Box::new(move |_, ev| {
                *sink.lock() = Some(ev.into_bytes());
            }),
        )
        .unwrap();
        assert_eq!(got.lock().as_deref(), Some(b"abcd".as_ref()));

        // The remaining two bytes satisfy the next registration without
        // any new transport activity.
        let rest: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let sink = rest.clone();
        conn.request_recv(
            2,
            false,
            Box::new(move |_, ev| {
                *sink.lock() = Some(ev.into_bytes());
            }),
        )
        .unwrap();
        assert_eq!(rest.lock().as_deref(), Some(b"ef".as_ref()));
    }

    #[tokio::test]
    async fn test_fire_on_partial_delivers_and_disarms() {
        let (conn, mock) = mock_conn(64);
        let got: Arc<Mutex<Vec<(bool, Bytes)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = got.clone();
        conn.request_recv(
            100,
            true,
            Box::new(move |_, ev| {
                sink.lock().push((ev.is_complete(), ev.into_bytes()));
            }),
        )
        .unwrap();

        mock.push_rx(b"part");
        conn.on_recv_ready();

        {
            let fired = got.lock();
            assert_eq!(fired.len(), 1);
            assert!(!fired[0].0);
            assert_eq!(&fired[0].1[..], b"part");
        }

        // Registration was consumed by the partial fire; more data sits
        // in the transport untouched until somebody re-registers.
        mock.push_rx(b"more");
        conn.on_recv_ready();
        assert_eq!(got.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_recv_keeps_buffered_bytes() {
        let (conn, mock) = mock_conn(64);

        conn.request_recv(10, false, Box::new(|_, _| panic!("cancelled; must not fire")))
            .unwrap();
        mock.push_rx(b"abc");
        conn.on_recv_ready();
        conn.cancel_recv();

        // More data arriving fires nothing.
        mock.push_rx(b"def");
        conn.on_recv_ready();

        // A fresh registration sees the bytes accumulated before the
        // cancellation, then the rest.
        let got: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
        let sink = got.clone();
        conn.request_recv(
            6,
            false,
            Box::new(move |_, ev| {
                *sink.lock() = Some(ev.into_bytes());
            }),
        )
        .unwrap();
        conn.on_recv_ready();
        assert_eq!(got.lock().as_deref(), Some(b"abcdef".as_ref()));
    }

    #[tokio::test]
    async fn test_recursive_request_recv_from_callback() {
        let (conn, mock) = mock_conn(64);
        let got: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = got.clone();
        conn.request_recv(
            3,
            false,
            Box::new(move |c, ev| {
                sink.lock().push(ev.into_bytes());
                // Re-register from inside the callback: arms only; the
                // outer dispatch loop delivers from remaining bytes.
                let inner = Arc::clone(&sink);
                let _ = c.request_recv(
                    3,
                    false,
                    Box::new(move |_, ev| {
                        inner.lock().push(ev.into_bytes());
                    }),
                );
            }),
        )
        .unwrap();

        mock.push_rx(b"abcdef");
        conn.on_recv_ready();

        let fired = got.lock();
        assert_eq!(fired.len(), 2);
        assert_eq!(&fired[0][..], b"abc");
        assert_eq!(&fired[1][..], b"def");
    }

    #[tokio::test]
    async fn test_send_completions_fire_in_enqueue_order() {
        let (conn, mock) = mock_conn(5);
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        // Queue {10, 0, 20} while the transport is parked, then drain
        // with at most 5 bytes accepted per write attempt.
        mock.set_write_budget(0);
        for (i, len) in [10usize, 0, 20].into_iter().enumerate() {
            let order = order.clone();
            conn.send(
                Bytes::from(vec![i as u8; len]),
                Some(Box::new(move |_| {
                    order.lock().push(len);
                })),
            )
            .unwrap();
        }
        assert!(order.lock().is_empty());

        mock.set_write_budget(usize::MAX);
        conn.on_send_ready();

        assert_eq!(*order.lock(), vec![10, 0, 20]);
        assert_eq!(mock.written().len(), 30);
    }

    #[tokio::test]
    async fn test_send_backpressure_resumes_on_writability() {
        let (conn, mock) = mock_conn(64);
        mock.set_write_budget(4);

        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        conn.send(
            Bytes::from_static(b"0123456789"),
            Some(Box::new(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        // 4 bytes went out, then the queue-full condition parked the rest.
        assert_eq!(mock.written(), b"0123");
        assert_eq!(done.load(Ordering::SeqCst), 0);

        // Writability is the sole retry trigger.
        mock.set_write_budget(usize::MAX);
        conn.on_send_ready();
        assert_eq!(mock.written(), b"0123456789");
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_callback_fires_once_then_not_connected() {
        let (conn, mock) = mock_conn(64);
        let errors: Arc<Mutex<Vec<Error>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = errors.clone();
        conn.set_error_handler(Box::new(move |_, e| {
            sink.lock().push(e);
        }));

        conn.request_recv(4, false, Box::new(|_, _| panic!("must not fire"))).unwrap();
        mock.set_eof();
        conn.on_recv_ready();

        assert_eq!(*errors.lock(), vec![Error::Eof]);
        assert_eq!(conn.phase(), Phase::Failed);

        // Second fatal condition: callback must not fire again.
        conn.report_error(Error::Io("again".into()));
        assert_eq!(errors.lock().len(), 1);

        // All further I/O fails fast without touching the transport.
        assert!(matches!(
            conn.send(Bytes::from_static(b"x"), None),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            conn.request_recv(1, false, Box::new(|_, _| {})),
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_hook_and_release_fire_exactly_once() {
        let (conn, mock) = mock_conn(64);
        let close_calls = mock.close_calls.clone();
        let release_calls = mock.release_calls.clone();

        let extra = conn.clone();
        assert!(conn.handle_count() >= 2);

        conn.close();
        conn.close();
        assert_eq!(close_calls.load(Ordering::SeqCst), 1);

        drop(conn);
        drop(extra);
        drop(mock);
        // Close ran once; the backend released once all owners dropped.
        assert_eq!(close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_of_last_handle_runs_hooks() {
        let (conn, mock) = mock_conn(64);
        let close_calls = mock.close_calls.clone();
        let release_calls = mock.release_calls.clone();

        drop(conn);
        drop(mock);
        // Yield so the parked driver observes the teardown and drops its
        // backend clone.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_from_inside_callback_is_safe() {
        let (conn, mock) = mock_conn(64);
        let fired = Arc::new(AtomicUsize::new(0));

        let flag = fired.clone();
        conn.request_recv(
            2,
            false,
            Box::new(move |c, _| {
                c.close();
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        mock.push_rx(b"ok");
        conn.on_recv_ready();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(conn.phase(), Phase::Closed);
        assert_eq!(mock.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_drains_and_times_out() {
        let (conn, mock) = mock_conn(64);
        conn.send(Bytes::from_static(b"payload"), None).unwrap();
        conn.flush().await.unwrap();
        assert_eq!(mock.written(), b"payload");

        // Parked queue with no writability: flush must hit the bound.
        let config = Config::default().with_drain_timeout(std::time::Duration::from_millis(20));
        let mock2 = MockBackend::new(64);
        mock2.set_write_budget(0);
        let backend: Arc<dyn Backend> = mock2.clone();
        let conn2 = Connection::new_connected(TransportKind::Stream, config, backend);
        conn2.send(Bytes::from_static(b"stuck"), None).unwrap();
        assert!(conn2.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_lock_is_reentrant_and_observable() {
        let (conn, _mock) = mock_conn(64);
        assert!(!conn.is_locked());
        let guard = conn.lock();
        assert!(conn.is_locked());
        // Reentrant: operations under an explicit guard still work.
        assert_eq!(conn.phase(), Phase::Connected);
        drop(guard);
    }

    #[tokio::test]
    async fn test_create_phase_checks() {
        let conn = Connection::create(TransportKind::Stream, Config::default()).unwrap();
        assert_eq!(conn.phase(), Phase::Created);
        assert!(matches!(
            conn.send(Bytes::new(), None),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            conn.listen(Box::new(|_| {})),
            Err(Error::InvalidPhase(_))
        ));

        let pipe_addr = TransportAddr::Pipe(std::path::PathBuf::from("/tmp/x"));
        assert!(matches!(
            conn.bind(&pipe_addr),
            Err(Error::AddressKindMismatch)
        ));
    }
}
