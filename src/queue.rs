// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Single-producer / single-consumer byte-record ring buffer. Exactly one
// writer and one reader may call `enqueue`/`dequeue` concurrently; any
// other usage is undefined, same as for a plain `VecDeque` shared across
// threads without synchronization. The ring holds `capacity + 1` slots so
// that `head == tail` is unambiguously "empty" and `(tail+1) % len == head`
// is unambiguously "full" -- no separate count field is needed.
//
// Hand-off between slots is synchronized with `Ordering::Release` on the
// writer's index store and `Ordering::Acquire` on the reader's index load,
// which is the portable equivalent of the store-store barrier a C
// implementation would insert between the payload write and the index
// bump: every byte the reader observes through an acquired `tail` was
// written-before that release, so a reader that sees a new tail always
// sees the complete payload and length that go with it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::QueueError;
use crate::waiter::Waiter;

const MAX_QUEUE_LEN: usize = 256;
const MAX_ITEM_LEN: usize = 32_768;

struct Slot {
    len: AtomicUsize,
    data: UnsafeCell<Box<[u8]>>,
}

// Safety: `data` is only touched by the writer (enqueue) before the
// Release store of `tail`, and by the reader (dequeue) after the Acquire
// load of `tail` observes that store -- never concurrently.
unsafe impl Sync for Slot {}

impl std::fmt::Debug for FifoQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoQueue")
            .field("item_bound", &self.item_bound)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// A bounded SPSC ring of byte records, each up to `item_bound` bytes.
pub struct FifoQueue {
    item_bound: usize,
    len: usize, // capacity + 1
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: Box<[Slot]>,
    /// Sleep/wake pairing for a reader blocked on an empty queue. Optional
    /// because some queues (none in this crate, but conceivable in tests)
    /// are polled rather than slept on.
    waiter: Waiter,
}

impl FifoQueue {
    /// Create a queue holding up to `capacity` items of up to `item_bound`
    /// bytes each.
    pub fn create(capacity: usize, item_bound: usize) -> Result<Self, QueueError> {
        if !(1..=MAX_QUEUE_LEN).contains(&capacity) || !(1..=MAX_ITEM_LEN).contains(&item_bound) {
            return Err(QueueError::BadParameter);
        }
        let len = capacity + 1;
        let slots = (0..len)
            .map(|_| Slot {
                len: AtomicUsize::new(0),
                data: UnsafeCell::new(vec![0u8; item_bound].into_boxed_slice()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            item_bound,
            len,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots,
            waiter: Waiter::new(),
        })
    }

    /// The waiter a reader should park on between failed `dequeue` calls.
    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    /// Enqueue `buf`. On success, wakes a parked reader if the queue might
    /// have been empty before this call (false positives are harmless;
    /// false negatives cannot occur because only the writer advances
    /// `tail`).
    pub fn enqueue(&self, buf: &[u8]) -> Result<(), QueueError> {
        if buf.len() > self.item_bound {
            return Err(QueueError::BadParameter);
        }
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let next = (tail + 1) % self.len;
        if next == head {
            return Err(QueueError::ItemDiscarded);
        }

        let slot = &self.slots[tail];
        // Safety: `tail` is owned exclusively by the writer until the
        // Release store below publishes it.
        unsafe { (&mut *slot.data.get())[..buf.len()].copy_from_slice(buf) };
        slot.len.store(buf.len(), Ordering::Relaxed);

        self.tail.store(next, Ordering::Release);

        // Was the queue empty before this enqueue? `head + 1 == next` means
        // the slot we just filled was the only one between head and tail.
        if (head + 1) % self.len == next {
            self.waiter.notify_one();
        }
        Ok(())
    }

    /// Dequeue the oldest item into `buf`, returning the number of bytes
    /// written. Returns [`QueueError::Empty`] without blocking if the
    /// queue has nothing ready, and [`QueueError::InadequateSpace`]
    /// without consuming the item if `buf` is too small.
    pub fn dequeue(&self, buf: &mut [u8]) -> Result<usize, QueueError> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return Err(QueueError::Empty);
        }

        let slot = &self.slots[head];
        let item_len = slot.len.load(Ordering::Relaxed);
        if item_len > buf.len() {
            return Err(QueueError::InadequateSpace);
        }
        // Safety: the Acquire load of `tail` above synchronizes-with the
        // writer's Release store, so the payload write it guards is
        // visible here.
        buf[..item_len].copy_from_slice(unsafe { &(&*slot.data.get())[..item_len] });

        self.head.store((head + 1) % self.len, Ordering::Release);
        Ok(item_len)
    }

    /// Block until an item is available or `timeout` elapses, then
    /// dequeue it. A `None` timeout blocks indefinitely.
    pub fn dequeue_blocking(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, QueueError> {
        loop {
            match self.dequeue(buf) {
                Err(QueueError::Empty) => {}
                other => return other,
            }
            let woke = self.waiter.wait_while(timeout, || {
                self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Acquire)
            });
            if !woke {
                return Err(QueueError::Empty);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_bad_parameters() {
        assert_eq!(FifoQueue::create(0, 16).unwrap_err(), QueueError::BadParameter);
        assert_eq!(FifoQueue::create(4, 0).unwrap_err(), QueueError::BadParameter);
    }

    #[test]
    fn dequeue_on_empty_queue_fails() {
        let q = FifoQueue::create(4, 16).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(q.dequeue(&mut buf).unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn round_trips_an_item() {
        let q = FifoQueue::create(4, 16).unwrap();
        q.enqueue(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = q.dequeue(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_discards_new_items() {
        let q = FifoQueue::create(2, 4).unwrap();
        q.enqueue(b"a").unwrap();
        q.enqueue(b"b").unwrap();
        assert_eq!(q.enqueue(b"c").unwrap_err(), QueueError::ItemDiscarded);
    }

    #[test]
    fn oversized_item_is_rejected() {
        let q = FifoQueue::create(2, 4).unwrap();
        assert_eq!(q.enqueue(b"toolong").unwrap_err(), QueueError::BadParameter);
    }

    #[test]
    fn undersized_destination_buffer_is_rejected_without_consuming() {
        let q = FifoQueue::create(2, 16).unwrap();
        q.enqueue(b"hello").unwrap();
        let mut tiny = [0u8; 2];
        assert_eq!(
            q.dequeue(&mut tiny).unwrap_err(),
            QueueError::InadequateSpace
        );
        let mut buf = [0u8; 16];
        let n = q.dequeue(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn preserves_fifo_order_under_concurrent_producer_consumer() {
        let q = Arc::new(FifoQueue::create(8, 8).unwrap());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..500u32 {
                    loop {
                        if q.enqueue(&i.to_le_bytes()).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        };
        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let mut expected = 0u32;
            while expected < 500 {
                match q.dequeue_blocking(&mut buf, Some(Duration::from_secs(5))) {
                    Ok(n) => {
                        let got = u32::from_le_bytes(buf[..n].try_into().unwrap());
                        assert_eq!(got, expected);
                        expected += 1;
                    }
                    Err(QueueError::Empty) => panic!("producer stalled"),
                    Err(e) => panic!("unexpected error: {e:?}"),
                }
            }
        });
        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
