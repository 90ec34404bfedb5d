//! Bounded, blocking multi-producer/multi-consumer queue.
//!
//! This is the backpressure point of the pool. The producer thread pushes work
//! items with [`Sender::send`], which blocks once `capacity` items are waiting;
//! the dispatcher pulls them with [`Receiver::recv`] in FIFO order. The same
//! queue, used through [`Sender::try_send`] and [`Receiver::try_recv`], backs
//! the failure channel of process workers.
//!
//! Both halves count their clones. Dropping the last [`Sender`] half-closes the
//! queue: receivers drain what is left and then observe disconnection. Dropping
//! the last [`Receiver`] closes it completely: buffered items are discarded and
//! blocked senders wake up with their item handed back.
//!
//! A receiver can also be tied to a [`CancelToken`] with
//! [`Receiver::interrupt_on`]. Once the token trips, both halves behave as
//! if the other side were gone, which releases a dispatcher waiting on a slow
//! source.

use std::collections::VecDeque;
use std::sync::mpsc::{RecvError, SendError, TryRecvError, TrySendError};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::cancel::{CancelToken, Interrupt};

/// Creates a bounded queue holding at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero. Callers validate the configured buffer sizes
/// before getting here.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let queue = BoundedQueue::new(capacity);
    (Sender(queue.clone()), Receiver(queue))
}

/// The producing half of a [`bounded`] queue.
pub struct Sender<T>(BoundedQueue<T>);

impl<T> Sender<T> {
    /// Pushes `item`, blocking while the queue is full.
    ///
    /// Fails, returning the item, once every receiver is gone.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        self.0.enqueue(item).map_err(SendError)
    }

    /// Pushes `item` without blocking.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        match self.0.try_enqueue(item) {
            Ok(()) => Ok(()),
            Err(TryEnqueueError::Full(item)) => Err(TrySendError::Full(item)),
            Err(TryEnqueueError::Disconnected(item)) => Err(TrySendError::Disconnected(item)),
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.0.add_producer();
        Sender(self.0.clone())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.0.drop_producer();
    }
}

/// The consuming half of a [`bounded`] queue.
pub struct Receiver<T>(BoundedQueue<T>);

impl<T> Receiver<T> {
    /// Pops the oldest item, blocking while the queue is empty.
    ///
    /// Returns [`RecvError`] once the queue is empty and every sender is gone.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.0.dequeue().ok_or(RecvError)
    }

    /// Pops the oldest item without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.0.try_dequeue() {
            Ok(item) => Ok(item),
            Err(TryDequeueError::Empty) => Err(TryRecvError::Empty),
            Err(TryDequeueError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Closes the queue when `cancel` trips: `recv` then fails even though
    /// senders remain, and blocked senders get their items back.
    pub(crate) fn interrupt_on(&self, cancel: &CancelToken)
    where
        T: Send + 'static,
    {
        let weak: Weak<dyn Interrupt> = Arc::downgrade(&self.0.inner) as Weak<dyn Interrupt>;
        cancel.watch(weak);
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.0.add_consumer();
        Receiver(self.0.clone())
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.0.drop_consumer();
    }
}

enum TryEnqueueError<T> {
    Full(T),
    Disconnected(T),
}

enum TryDequeueError {
    Empty,
    Disconnected,
}

/// Shared queue core. Cloning shares the state without touching the
/// producer/consumer counts; [`Sender`] and [`Receiver`] maintain those.
struct BoundedQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        BoundedQueue {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    /// Signalled when an item is pushed or the last producer leaves.
    not_empty: Condvar,
    /// Signalled when an item is popped or the last consumer leaves.
    not_full: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    producers: usize,
    consumers: usize,
    interrupted: bool,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        assert_ne!(capacity, 0, "bounded queue requires a non-zero capacity");
        BoundedQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    capacity,
                    producers: 1,
                    consumers: 1,
                    interrupted: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // Poisoning only happens if a panic escapes while the lock is held,
        // and no user code runs under this lock.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_producer(&self) {
        let mut state = self.lock();
        assert!(state.producers != 0, "queue is already half-closed");
        state.producers += 1;
    }

    fn drop_producer(&self) {
        let mut state = self.lock();
        assert!(state.producers >= 1, "unbalanced drop_producer");
        state.producers -= 1;
        if state.producers == 0 {
            self.inner.not_empty.notify_all();
        }
    }

    fn add_consumer(&self) {
        let mut state = self.lock();
        assert!(state.consumers != 0, "queue is already closed");
        state.consumers += 1;
    }

    fn drop_consumer(&self) {
        let mut state = self.lock();
        assert!(state.consumers >= 1, "unbalanced drop_consumer");
        state.consumers -= 1;
        if state.consumers == 0 {
            state.items.clear();
            self.inner.not_full.notify_all();
        }
    }

    fn enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        loop {
            if state.consumers == 0 || state.interrupted {
                return Err(item);
            }
            if state.items.len() < state.capacity {
                break;
            }
            state = self
                .inner
                .not_full
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.items.push_back(item);
        drop(state);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut state = self.lock();
        if state.consumers == 0 || state.interrupted {
            return Err(TryEnqueueError::Disconnected(item));
        }
        if state.items.len() >= state.capacity {
            return Err(TryEnqueueError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    fn dequeue(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.interrupted {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.inner.not_full.notify_one();
                return Some(item);
            }
            if state.producers == 0 {
                return None;
            }
            state = self
                .inner
                .not_empty
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn try_dequeue(&self) -> Result<T, TryDequeueError> {
        let mut state = self.lock();
        if state.interrupted {
            return Err(TryDequeueError::Disconnected);
        }
        if let Some(item) = state.items.pop_front() {
            drop(state);
            self.inner.not_full.notify_one();
            return Ok(item);
        }
        if state.producers == 0 {
            Err(TryDequeueError::Disconnected)
        } else {
            Err(TryDequeueError::Empty)
        }
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }
}

impl<T: Send> Interrupt for Inner<T> {
    fn interrupt(&self) {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .interrupted = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
