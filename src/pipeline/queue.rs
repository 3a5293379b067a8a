//! Bounded frame queue between the capture callback and the detection worker

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, trace};

use crate::capture::Frame;

/// Default capacity: one slot keeps end-to-end latency minimal.
pub const DEFAULT_CAPACITY: usize = 1;

/// Result of [`FrameQueue::enqueue`].
#[derive(Debug)]
pub enum Enqueued {
    /// The frame was queued without eviction.
    Accepted,
    /// The frame was queued and the oldest queued frame was evicted.
    Replaced(Frame),
    /// The queue is closed; the frame is handed back untouched.
    Rejected(Frame),
}

/// Result of [`FrameQueue::wait`].
#[derive(Debug)]
pub enum Waited {
    Frame(Frame),
    /// [`FrameQueue::wake`] was called with no frame queued.
    Woken,
    Closed,
}

/// Queue counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub taken: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    taken: AtomicU64,
    dropped: AtomicU64,
}

struct Slots {
    ring: HeapRb<Frame>,
    closed: bool,
    woken: bool,
}

/// Drop-oldest frame queue for one producer and one consumer.
///
/// `enqueue` never waits for the consumer: when all slots are taken the
/// oldest frame is evicted. `take` parks the consumer on a condition variable
/// until a frame arrives or the queue is closed.
///
/// Work published through [`FrameQueue::if_open`] is ordered against
/// [`FrameQueue::close`]: once `close` returns, no such work is running and
/// none will start.
pub struct FrameQueue {
    slots: Mutex<Slots>,
    ready: Condvar,
    emit: Mutex<()>,
    capacity: usize,
    stats: CachePadded<Counters>,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                ring: HeapRb::new(capacity),
                closed: false,
                woken: false,
            }),
            ready: Condvar::new(),
            emit: Mutex::new(()),
            capacity,
            stats: CachePadded::new(Counters::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave the ring half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Producer: queue a frame, evicting the oldest one when full.
    pub fn enqueue(&self, mut frame: Frame) -> Enqueued {
        let mut slots = self.lock();
        if slots.closed {
            return Enqueued::Rejected(frame);
        }

        frame.mark_enqueued(Instant::now());
        let evicted = slots.ring.push_overwrite(frame);
        drop(slots);

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tagview_frames_enqueued_total").increment(1);
        self.ready.notify_one();

        match evicted {
            Some(old) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("tagview_frames_dropped_total").increment(1);
                debug!(
                    sequence = old.meta().sequence,
                    dropped,
                    "frame queue overflow, evicted oldest frame"
                );
                Enqueued::Replaced(old)
            }
            None => Enqueued::Accepted,
        }
    }

    /// Consumer: block until a frame is available.
    ///
    /// Returns `None` once the queue is closed.
    pub fn take(&self) -> Option<Frame> {
        loop {
            match self.wait() {
                Waited::Frame(frame) => return Some(frame),
                Waited::Woken => continue,
                Waited::Closed => return None,
            }
        }
    }

    /// Consumer: block until a frame arrives, [`wake`](Self::wake) is called
    /// or the queue is closed.
    pub fn wait(&self) -> Waited {
        let mut slots = self.lock();
        loop {
            if slots.closed {
                return Waited::Closed;
            }
            if let Some(frame) = slots.ring.try_pop() {
                drop(slots);
                self.stats.taken.fetch_add(1, Ordering::Relaxed);
                trace!(sequence = frame.meta().sequence, "frame taken");
                return Waited::Frame(frame);
            }
            if std::mem::take(&mut slots.woken) {
                return Waited::Woken;
            }
            slots = self
                .ready
                .wait(slots)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Return a consumer blocked in [`wait`](Self::wait) without a frame.
    pub fn wake(&self) {
        self.lock().woken = true;
        self.ready.notify_all();
    }

    /// Run `f` unless the queue is closed.
    ///
    /// A concurrent `close` waits for `f` to finish.
    pub fn if_open<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _emit = self.emit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_closed() {
            return None;
        }
        Some(f())
    }

    /// Consumer: take a frame if one is queued, without blocking.
    pub fn try_take(&self) -> Option<Frame> {
        let mut slots = self.lock();
        if slots.closed {
            return None;
        }
        let frame = slots.ring.try_pop();
        if frame.is_some() {
            self.stats.taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Close the queue, release queued frames and wake a blocked consumer.
    ///
    /// Waits for a running [`if_open`](Self::if_open) call. Returns the number
    /// of frames released.
    pub fn close(&self) -> usize {
        let _emit = self.emit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut slots = self.lock();
        slots.closed = true;
        let mut released = 0;
        while slots.ring.try_pop().is_some() {
            released += 1;
        }
        drop(slots);
        self.ready.notify_all();
        released
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
