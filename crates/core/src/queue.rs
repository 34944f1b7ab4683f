use crossbeam_queue::ArrayQueue;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Result of attempting to enqueue a message.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{SendOutcome, mailbox};
///
/// let (tx, _rx) = mailbox::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Message was accepted.
    Ok,
    /// Mailbox is full; the message was not enqueued.
    Full,
    /// Mailbox has been closed.
    Closed,
}

/// Result of attempting to dequeue a message.
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received message.
    Data(T),
    /// Mailbox has been closed and drained.
    Closed,
    /// Mailbox currently empty.
    Empty,
}

/// Producer half of a bounded mailbox.
///
/// Sends never block; a full mailbox is reported to the caller. Cloneable
/// so a transport thread and its shutdown path can both hold one.
#[derive(Clone)]
pub struct MailboxTx<T> {
    inner: Arc<MailboxInner<T>>,
}

impl<T> MailboxTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        self.inner
            .queue
            .push(value)
            .map(|_| SendOutcome::Ok)
            .unwrap_or(SendOutcome::Full)
    }

    /// Close the mailbox to further sends.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Consumer half of a bounded mailbox.
///
/// The event thread drains this between callbacks; `recv` never blocks.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{RecvOutcome, mailbox};
///
/// let (tx, rx) = mailbox::<u8>(4);
/// let _ = tx.send(9);
/// assert!(matches!(rx.recv(), RecvOutcome::Data(9)));
/// assert!(matches!(rx.recv(), RecvOutcome::Empty));
/// ```
#[derive(Clone)]
pub struct MailboxRx<T> {
    inner: Arc<MailboxInner<T>>,
}

impl<T> MailboxRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        match self.inner.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None => {
                if self.inner.closed.load(Ordering::Acquire) {
                    RecvOutcome::Closed
                } else {
                    RecvOutcome::Empty
                }
            }
        }
    }

    /// Mark the mailbox as closed; senders will observe `Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct MailboxInner<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
}

/// Create a bounded mailbox with the given capacity.
pub fn mailbox<T>(capacity: usize) -> (MailboxTx<T>, MailboxRx<T>) {
    let inner = Arc::new(MailboxInner {
        queue: ArrayQueue::new(capacity),
        closed: AtomicBool::new(false),
    });
    (
        MailboxTx {
            inner: inner.clone(),
        },
        MailboxRx { inner },
    )
}
