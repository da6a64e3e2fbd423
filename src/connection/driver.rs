//! Per-connection readiness driver.
//!
//! One task per connection parks on the transport's readiness futures
//! (the poller integration) and dispatches into the connection when the
//! transport becomes readable or writable, or when a peer arrives on a
//! listening connection. The driver holds only a weak handle while
//! suspended; it upgrades to a strong handle for the duration of each
//! dispatch, which is what keeps a connection alive while one of its own
//! callbacks tears it down. When the last user handle drops, the upgrade
//! fails and the driver retires.

use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tracing::trace;

use super::handle::{Binding, Connection, Shared};
use crate::backend::{Acceptor, Backend};
use crate::error::Error;

pub(crate) fn spawn(shared: &Arc<Shared>) {
    let weak = Arc::downgrade(shared);
    let wake = shared.wake.clone();
    tokio::spawn(run(weak, wake));
}

enum Interest {
    /// Nothing to wait for except an interest change.
    Idle,
    /// Duplex transport with at least one direction wanted.
    Duplex {
        backend: Arc<dyn Backend>,
        want_recv: bool,
        want_send: bool,
    },
    /// Listening connection with an accept callback armed.
    Accept(Arc<dyn Acceptor>),
    /// Connection is gone or terminal.
    Exit,
}

async fn run(weak: Weak<Shared>, wake: Arc<Notify>) {
    loop {
        match snapshot(&weak) {
            Interest::Exit => {
                trace!("driver retired");
                return;
            }
            Interest::Idle => wake.notified().await,
            Interest::Duplex {
                backend,
                want_recv,
                want_send,
            } => {
                // Backend-buffered bytes don't produce a new readiness
                // event; dispatch for them directly.
                if want_recv && backend.has_pending_data() {
                    dispatch(&weak, Connection::on_recv_ready);
                    continue;
                }
                tokio::select! {
                    _ = wake.notified() => {}
                    res = backend.recv_ready(), if want_recv => match res {
                        Ok(()) => dispatch(&weak, Connection::on_recv_ready),
                        Err(e) => report(&weak, e),
                    },
                    res = backend.send_ready(), if want_send => match res {
                        Ok(()) => dispatch(&weak, Connection::on_send_ready),
                        Err(e) => report(&weak, e),
                    },
                }
            }
            Interest::Accept(acceptor) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    res = acceptor.accept() => {
                        let Some(shared) = weak.upgrade() else { return };
                        let conn = Connection { shared };
                        match res {
                            Ok((backend, peer)) => conn.dispatch_accept(backend, peer),
                            Err(e) => conn.report_error(e),
                        }
                    }
                }
            }
        }
    }
}

/// Capture current interest under the lock, without keeping the strong
/// handle. The backend handle is cloned only when there is something to
/// wait for on it, so an idle driver pins no transport resources.
fn snapshot(weak: &Weak<Shared>) -> Interest {
    let Some(shared) = weak.upgrade() else {
        return Interest::Exit;
    };
    let conn = Connection { shared };
    let guard = conn.shared.lock.lock();
    let core = guard.borrow();
    if core.phase.is_terminal() {
        return Interest::Exit;
    }
    match &core.binding {
        Binding::None => Interest::Idle,
        Binding::Duplex(b) => {
            let want_recv = core.recv.armed();
            let want_send = !core.send.queue.is_empty();
            if want_recv || want_send {
                Interest::Duplex {
                    backend: b.clone(),
                    want_recv,
                    want_send,
                }
            } else {
                Interest::Idle
            }
        }
        Binding::Accept(a) => {
            if core.accept_fn.is_some() {
                Interest::Accept(a.clone())
            } else {
                Interest::Idle
            }
        }
    }
}

fn dispatch(weak: &Weak<Shared>, f: fn(&Connection)) {
    if let Some(shared) = weak.upgrade() {
        f(&Connection { shared });
    }
}

fn report(weak: &Weak<Shared>, err: Error) {
    if let Some(shared) = weak.upgrade() {
        Connection { shared }.report_error(err);
    }
}
