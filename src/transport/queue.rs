//! Bounded drop-oldest queue backing each transport link's high-water-mark

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::sync::Notify;

use crate::error::TransportError;

/// Fixed-capacity queue that evicts its oldest entry instead of blocking
/// the producer.
///
/// Consumers either block on [`pop_timeout`](Self::pop_timeout) or await
/// [`pop`](Self::pop). Each queue has a single consumer.
pub struct DropOldestQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    /// Wakes an async consumer
    ready: Notify,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Inner<T> {
    ring: HeapRb<T>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    dropped: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub popped: usize,
    pub dropped: usize,
    /// Deepest the queue has ever been
    pub peak: usize,
}

#[derive(Debug)]
pub enum Push<T> {
    Queued,
    /// Queued after evicting the returned oldest entry
    Evicted(T),
    /// Rejected, the queue is closed
    Closed(T),
}

#[derive(Debug)]
pub enum Pop<T> {
    Item(T),
    Timeout,
    Closed,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, TransportError> {
        if capacity == 0 {
            return Err(TransportError::InvalidHighWaterMark);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                ring: HeapRb::new(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            ready: Notify::new(),
            stats: CachePadded::new(Stats::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: never blocks
    pub fn push(&self, item: T) -> Push<T> {
        let mut inner = self.lock();
        if inner.closed {
            return Push::Closed(item);
        }

        let evicted = inner.ring.push_overwrite(item);
        let depth = inner.ring.occupied_len();
        drop(inner);

        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        self.stats.peak.fetch_max(depth, Ordering::Relaxed);
        self.available.notify_one();
        self.ready.notify_one();

        match evicted {
            Some(old) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Push::Evicted(old)
            }
            None => Push::Queued,
        }
    }

    /// Consumer: wait up to `timeout` for the oldest entry. A closed queue
    /// yields nothing further, even if entries remain.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Pop::Closed;
            }
            if let Some(item) = self.take(&mut inner) {
                return Pop::Item(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Timeout;
            }
            inner = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Await the oldest entry. `None` once the queue is closed.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = self.take(&mut inner) {
                    return Some(item);
                }
            }
            // A push racing this wait leaves a permit behind
            self.ready.notified().await;
        }
    }

    fn take(&self, inner: &mut Inner<T>) -> Option<T> {
        let item = inner.ring.try_pop()?;
        self.stats.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Close the queue and wake every waiting consumer.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.ring.clear();
        drop(inner);
        self.available.notify_all();
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            peak: self.stats.peak.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            DropOldestQueue::<u32>::new(0),
            Err(TransportError::InvalidHighWaterMark)
        ));
    }

    #[test]
    fn overflow_evicts_oldest_and_never_exceeds_capacity() {
        let queue = DropOldestQueue::new(6).unwrap();
        for i in 0..12u32 {
            let outcome = queue.push(i);
            if i < 6 {
                assert!(matches!(outcome, Push::Queued));
            } else {
                assert!(matches!(outcome, Push::Evicted(old) if old == i - 6));
            }
            assert!(queue.stats().peak <= 6);
        }

        let stats = queue.stats();
        assert_eq!(stats.pushed, 12);
        assert_eq!(stats.dropped, 6);
        assert_eq!(stats.peak, 6);

        // The newest six survive, oldest first
        for expected in 6..12u32 {
            assert!(matches!(queue.pop_timeout(Duration::ZERO), Pop::Item(v) if v == expected));
        }
        assert!(matches!(queue.pop_timeout(Duration::ZERO), Pop::Timeout));
    }

    #[test]
    fn pop_wakes_on_push() {
        let queue = Arc::new(DropOldestQueue::new(2).unwrap());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push("frame");
        });
        assert!(matches!(
            queue.pop_timeout(Duration::from_secs(5)),
            Pop::Item("frame")
        ));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn async_pop_drains_in_order_then_ends_on_close() {
        let queue = Arc::new(DropOldestQueue::new(4).unwrap());
        let consumer = queue.clone();
        let drained = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(item) = consumer.pop().await {
                seen.push(item);
            }
            seen
        });

        for i in 0..3u32 {
            queue.push(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Wait for the consumer to catch up before closing discards the rest
        while queue.stats().popped < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.close();
        assert_eq!(drained.await.unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn close_wakes_consumer_and_rejects_producer() {
        let queue = Arc::new(DropOldestQueue::new(2).unwrap());
        let waiter = queue.clone();
        let handle = std::thread::spawn(move || waiter.pop_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(matches!(handle.join().unwrap(), Pop::<u8>::Closed));
        assert!(matches!(queue.push(1), Push::Closed(1)));
        assert!(queue.is_closed());
    }
}
