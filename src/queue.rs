//! Bounded inter-thread message queue with sticky closure states.
//!
//! Each pipeline edge is one of these queues: a fixed-capacity FIFO whose
//! `send` and `recv` take a per-call blocking flag, plus two sticky error
//! states, one per side. Closing the send side makes every subsequent
//! `send` fail immediately; closing the receive side lets `recv` drain the
//! messages already queued and then report [`QueueError::Eof`]. Messages
//! still queued when the last handle is dropped are released with their
//! payloads.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Error returned by queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Non-blocking op could not proceed: the queue is full (send) or
    /// empty (recv).
    WouldBlock,
    /// The relevant side of the queue has been closed.
    Eof,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "queue operation would block"),
            Self::Eof => write!(f, "queue closed"),
        }
    }
}

impl std::error::Error for QueueError {}

struct State<T> {
    buf: VecDeque<T>,
    cap: usize,
    send_closed: bool,
    recv_closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when a message arrives or the receive side closes.
    readable: Condvar,
    /// Signalled when space frees up or the send side closes.
    writable: Condvar,
}

/// A bounded FIFO of messages shared between exactly one sender thread and
/// one receiver thread. Cloning yields another handle to the same queue.
pub struct MessageQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> MessageQueue<T> {
    /// Creates a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buf: VecDeque::with_capacity(capacity),
                    cap: capacity,
                    send_closed: false,
                    recv_closed: false,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
            }),
        }
    }

    /// Enqueues a message.
    ///
    /// With `blocking` set, waits for space; otherwise a full queue returns
    /// [`QueueError::WouldBlock`]. Closing either side makes every
    /// subsequent or blocked `send` drop the message and return `Eof`.
    pub fn send(&self, msg: T, blocking: bool) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().unwrap();
        while !state.send_closed && !state.recv_closed && state.buf.len() >= state.cap {
            if !blocking {
                return Err(QueueError::WouldBlock);
            }
            state = self.shared.writable.wait(state).unwrap();
        }
        if state.send_closed || state.recv_closed {
            return Err(QueueError::Eof);
        }
        state.buf.push_back(msg);
        drop(state);
        self.shared.readable.notify_all();
        Ok(())
    }

    /// Dequeues the next message.
    ///
    /// Messages already queued are delivered even after a side is closed;
    /// `Eof` surfaces only once the queue is empty. A non-blocking call on
    /// an empty, open queue returns [`QueueError::WouldBlock`].
    pub fn recv(&self, blocking: bool) -> Result<T, QueueError> {
        let mut state = self.shared.state.lock().unwrap();
        while !state.recv_closed && !state.send_closed && state.buf.is_empty() {
            if !blocking {
                return Err(QueueError::WouldBlock);
            }
            state = self.shared.readable.wait(state).unwrap();
        }
        match state.buf.pop_front() {
            Some(msg) => {
                drop(state);
                self.shared.writable.notify_all();
                Ok(msg)
            }
            None => Err(QueueError::Eof),
        }
    }

    /// Closes the send side: every subsequent or blocked `send` fails with
    /// `Eof`.
    pub fn close_send(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.send_closed = true;
        drop(state);
        self.shared.writable.notify_all();
        self.shared.readable.notify_all();
    }

    /// Closes the receive side: `recv` drains what is queued, then reports
    /// `Eof`.
    pub fn close_recv(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.recv_closed = true;
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Closes both sides.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.send_closed = true;
        state.recv_closed = true;
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Drops every queued message without blocking. Returns the number of
    /// messages discarded.
    pub fn drain(&self) -> usize {
        let mut state = self.shared.state.lock().unwrap();
        let n = state.buf.len();
        state.buf.clear();
        drop(state);
        self.shared.writable.notify_all();
        n
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().buf.len()
    }

    /// Returns true when no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().unwrap().cap
    }
}
