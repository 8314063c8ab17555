//! Single-permit async signal with FIFO wakeups.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::deque::Deque;

/// Outcome of a wait whose cancellation token fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait canceled")]
pub struct WaitCanceled;

/// An auto-reset event: each [`set`](AutoResetEvent::set) releases exactly
/// one pending waiter in FIFO order, or banks a single signal for the next
/// waiter if nobody is pending. Banked signals do not accumulate.
///
/// Waits are cancel- and drop-safe: a wait that is abandoned (its token
/// fired, or its future was dropped inside a `select!`) removes its waiter
/// registration, and a signal that was already handed to it is re-delivered
/// to the next waiter, so no `set` is ever lost.
pub struct AutoResetEvent {
    inner: Mutex<Inner>,
}

struct Inner {
    signaled: bool,
    next_id: u64,
    waiters: Deque<Waiter>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                signaled: false,
                next_id: 0,
                waiters: Deque::new(),
            }),
        }
    }

    /// Releases the oldest pending waiter, or banks one signal.
    pub fn set(&self) {
        let mut inner = self.inner.lock();
        loop {
            match inner.waiters.pop_front() {
                Some(w) => {
                    // A waiter whose receiver is already gone forfeits the
                    // signal; hand it to the next one in line.
                    if w.tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    inner.signaled = true;
                    return;
                }
            }
        }
    }

    /// Whether a signal is currently banked.
    pub fn is_set(&self) -> bool {
        self.inner.lock().signaled
    }

    /// Suspends until released by [`set`](AutoResetEvent::set), consuming
    /// one signal, or until `token` fires.
    pub async fn wait(&self, token: &CancellationToken) -> Result<(), WaitCanceled> {
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if inner.signaled {
                inner.signaled = false;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let mut guard = WaitGuard {
            event: self,
            id,
            rx,
            finished: false,
        };
        let result = tokio::select! {
            biased;
            res = &mut guard.rx => res.map_err(|_| WaitCanceled),
            _ = token.cancelled() => Err(WaitCanceled),
        };
        if result.is_ok() {
            guard.finished = true;
        }
        result
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters an abandoned wait and reclaims an in-flight signal.
struct WaitGuard<'a> {
    event: &'a AutoResetEvent,
    id: u64,
    rx: oneshot::Receiver<()>,
    finished: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let id = self.id;
        {
            let mut inner = self.event.inner.lock();
            let before = inner.waiters.len();
            inner.waiters.retain(|w| w.id != id);
            if inner.waiters.len() < before {
                return;
            }
        }
        // Our waiter was already popped by set(). If its signal landed in
        // the channel without being consumed, pass it on.
        if self.rx.try_recv().is_ok() {
            self.event.set();
        }
    }
}
