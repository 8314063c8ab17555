//! Bounded async hand-off queue between transport delivery tasks and the
//! per-entity dispatch loops.
//!
//! Producers either suspend while the queue is full ([`OverflowPolicy::Block`])
//! or evict the oldest unconsumed item ([`OverflowPolicy::DropOldest`]).
//! Completion is graceful (remaining items drain first), faults are sticky
//! and reach every blocked and future consumer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::deque::Deque;
use crate::event::AutoResetEvent;

/// What to do when an enqueue finds the queue at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Suspend the producer until a consumer makes room.
    Block,
    /// Evict the oldest unconsumed item and enqueue immediately.
    DropOldest,
}

/// Outcome of a suspending queue operation that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The operation's cancellation token fired while it was suspended.
    #[error("operation canceled")]
    Canceled,
    /// The queue was completed and holds no more items.
    #[error("queue closed")]
    Closed,
    /// An upstream error was recorded; it is sticky for all consumers.
    #[error("queue faulted: {0}")]
    Faulted(Arc<str>),
}

enum PushOutcome<T> {
    Pushed,
    /// Queue at capacity under `Block`; the item is handed back for retry.
    Full(T),
    Terminal(QueueError),
}

struct State<T> {
    buf: Deque<T>,
    completed: bool,
    fault: Option<Arc<str>>,
}

/// A bounded multi-producer FIFO drained by a single consumer loop.
pub struct AsyncQueue<T> {
    state: Mutex<State<T>>,
    items: AutoResetEvent,
    space: AutoResetEvent,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> AsyncQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                buf: Deque::with_capacity(capacity.clamp(1, 64)),
                completed: false,
                fault: None,
            }),
            items: AutoResetEvent::new(),
            space: AutoResetEvent::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn try_push(&self, item: T) -> PushOutcome<T> {
        let mut st = self.state.lock();
        if let Some(fault) = &st.fault {
            return PushOutcome::Terminal(QueueError::Faulted(fault.clone()));
        }
        if st.completed {
            return PushOutcome::Terminal(QueueError::Closed);
        }
        if st.buf.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    st.buf.pop_front();
                }
                OverflowPolicy::Block => return PushOutcome::Full(item),
            }
        }
        st.buf.push_back(item);
        drop(st);
        self.items.set();
        PushOutcome::Pushed
    }

    /// Enqueues without suspending. Returns `false` if the item was not
    /// accepted: the queue is completed, faulted, or full under
    /// [`OverflowPolicy::Block`]. A refused item counts as dropped.
    pub fn try_enqueue(&self, item: T) -> bool {
        matches!(self.try_push(item), PushOutcome::Pushed)
    }

    /// Enqueues, suspending while the queue is full under
    /// [`OverflowPolicy::Block`]. Under [`OverflowPolicy::DropOldest`] this
    /// never suspends.
    pub async fn enqueue(&self, mut item: T, token: &CancellationToken) -> Result<(), QueueError> {
        loop {
            match self.try_push(item) {
                PushOutcome::Pushed => return Ok(()),
                PushOutcome::Terminal(err) => {
                    // Pass the wake-up on so every blocked producer
                    // observes the terminal state.
                    self.space.set();
                    return Err(err);
                }
                PushOutcome::Full(returned) => item = returned,
            }
            if self.space.wait(token).await.is_err() {
                return Err(QueueError::Canceled);
            }
        }
    }

    /// Dequeues the oldest item, suspending while the queue is empty.
    ///
    /// Remaining items are still delivered after [`complete`](Self::complete);
    /// only then does this return [`QueueError::Closed`]. A recorded fault
    /// preempts remaining items and is returned to every blocked and future
    /// call.
    pub async fn dequeue(&self, token: &CancellationToken) -> Result<T, QueueError> {
        loop {
            {
                let mut st = self.state.lock();
                if let Some(fault) = &st.fault {
                    let fault = fault.clone();
                    drop(st);
                    // Cascade so every blocked consumer sees the fault.
                    self.items.set();
                    return Err(QueueError::Faulted(fault));
                }
                if let Some(item) = st.buf.pop_front() {
                    drop(st);
                    self.space.set();
                    return Ok(item);
                }
                if st.completed {
                    drop(st);
                    self.items.set();
                    return Err(QueueError::Closed);
                }
            }
            if self.items.wait(token).await.is_err() {
                return Err(QueueError::Canceled);
            }
        }
    }

    /// Marks the queue completed. Idempotent; wakes all waiters. Items
    /// already enqueued are still delivered to the consumer.
    pub fn complete(&self) {
        {
            let mut st = self.state.lock();
            if st.completed {
                return;
            }
            st.completed = true;
        }
        self.items.set();
        self.space.set();
    }

    /// Records a terminal fault. Only the first fault is kept; it is
    /// delivered to every blocked and future consumer call.
    pub fn fault(&self, reason: impl Into<Arc<str>>) {
        {
            let mut st = self.state.lock();
            if st.fault.is_some() {
                return;
            }
            st.fault = Some(reason.into());
        }
        self.items.set();
        self.space.set();
    }
}
