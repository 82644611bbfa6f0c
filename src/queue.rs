use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A fixed-capacity FIFO shared between two pipeline threads
///
/// Cloning yields another handle to the same queue. Blocking operations park
/// the calling thread until the counterpart operation frees a slot or delivers
/// an item, or until the queue is stopped.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    blocked_pushes: AtomicU64,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    /// Hard stop: every operation fails from now on
    stopped: bool,
    /// No more pushes; pops drain what is left
    closed: bool,
}

impl<T> State<T> {
    fn accepts(&self) -> bool {
        !self.stopped && !self.closed
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    stopped: false,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
                blocked_pushes: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue without blocking
    ///
    /// Hands the item back if the queue is full, closed or stopped.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.shared.state.lock();
        if !state.accepts() || state.items.len() >= self.shared.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for a free slot
    ///
    /// Hands the item back if the queue is closed or stopped before a slot frees up.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.shared.state.lock();
        if state.accepts() && state.items.len() >= self.shared.capacity {
            self.shared.blocked_pushes.fetch_add(1, Ordering::Relaxed);
            while state.accepts() && state.items.len() >= self.shared.capacity {
                self.shared.not_full.wait(&mut state);
            }
        }
        if !state.accepts() {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue without blocking
    ///
    /// Returns `None` if the queue is empty or stopped.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return None;
        }
        let item = state.items.pop_front()?;
        drop(state);
        self.shared.not_full.notify_one();
        Some(item)
    }

    /// Dequeue, waiting for an item
    ///
    /// Returns `None` once the queue is stopped, or once it is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Stop the queue and wake every waiter
    ///
    /// Items still queued are never delivered. Idempotent.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    /// Refuse further pushes while letting consumers drain what is queued
    ///
    /// Blocked producers fail; blocked consumers wake once the queue runs dry. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    /// Whether both handles refer to the same queue
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Fill level as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity()).min(100) as u32
    }

    /// Number of pushes that found the queue full and had to wait
    pub fn blocked_pushes(&self) -> u64 {
        self.shared.blocked_pushes.load(Ordering::Relaxed)
    }
}
