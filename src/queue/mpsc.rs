use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::ring::Cell;

/// A slot with a per-slot sequence stamp for [Vyukov](https://x.com/dvyukov)-style
/// synchronization.
///
/// Producers and the consumer synchronize through slot state rather than
/// constantly loading each other's cursors. Protocol:
/// - Initial: slot index (0, 1, 2, ..., N-1)
/// - After write: tail + 1 (signals "data ready for reader")
/// - After read: head + N (signals "slot ready for next writer lap")
struct Stamped<T> {
    stamp: AtomicUsize,
    value: Cell<T>,
}

/// Bounded lock-free MPSC queue for scalar fast-path values.
///
/// Any thread observing a scalar inner may push; only the drain pops. The
/// tail cursor is claimed with a CAS (multi-producer), the head cursor is
/// plain (single consumer), and slot stamps carry the data-ready handshake.
///
/// The physical ring is at least two slots: with a single slot the "free
/// for this lap" stamp equals the "holds data" stamp and the protocol can't
/// tell them apart. Smaller configured bounds are enforced against the
/// consumer cursor instead.
pub(crate) struct MpscRing<T> {
    slots: Box<[Stamped<T>]>,
    mask: usize,
    /// Configured bound; at most `mask + 1`.
    bound: usize,
    /// Producers' cursor - claimed via CAS.
    tail: CachePadded<AtomicUsize>,
    /// Consumer's cursor - only advanced by the drain.
    head: CachePadded<AtomicUsize>,
}

impl<T> MpscRing<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        let n = capacity.next_power_of_two().max(2);
        let slots = (0..n)
            .map(|i| Stamped {
                stamp: AtomicUsize::new(i),
                value: Cell::new(),
            })
            .collect();
        Self {
            slots,
            mask: n - 1,
            bound: capacity,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Physical slot count; the stamp protocol laps over this, not the
    /// configured bound.
    #[inline]
    const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Pushes a value, returning it back when the queue is full.
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            // acquire-load: observe consumption up to the head before
            // judging fullness against the configured bound
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.bound {
                return Err(value);
            }

            let slot = &self.slots[tail & self.mask];
            // acquire-load: pairs with the consumer's release-store of head + N
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp.wrapping_sub(tail) as isize;

            if diff == 0 {
                // Slot is free for this lap: claim the tail.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Safety: the CAS gave this producer exclusive
                        // ownership of the slot for this lap.
                        unsafe { slot.value.write(value) };
                        // release-store: publish the value to the consumer
                        slot.stamp.store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if diff < 0 {
                // The slot still holds last lap's value: queue is full.
                return Err(value);
            } else {
                // Another producer claimed this slot; reload the tail.
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Consumer takes the next value out of the queue, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        // Single consumer: the only one controlling the head
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];
        // acquire-load: pairs with the producer's release-store of tail + 1
        let stamp = slot.stamp.load(Ordering::Acquire);

        if stamp.wrapping_sub(head.wrapping_add(1)) as isize != 0 {
            return None;
        }

        // Safety: the stamp says a producer published this slot and nobody
        // else reads it.
        let out = unsafe { slot.value.read() };

        // release-store: hand the slot back to producers for the next lap
        slot.stamp
            .store(head.wrapping_add(self.capacity()), Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);

        Some(out)
    }

    pub(crate) fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        tail == head
    }

    /// Approximate number of buffered items.
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

unsafe impl<T: Send> Sync for MpscRing<T> {}
unsafe impl<T: Send> Send for MpscRing<T> {}

impl<T> Drop for MpscRing<T> {
    fn drop(&mut self) {
        // &mut self guarantees every push completed, so [head, tail) is
        // exactly the set of written-but-unread slots. Relaxed is fine: the
        // owning Arc's drop synchronized with all Release stores.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head);
        for s in 0..count {
            let slot = &self.slots[head.wrapping_add(s) & self.mask];
            // Safe: these slots are initialized (a producer wrote, the
            // consumer didn't read)
            unsafe { slot.value.drop_in_place() };
        }
    }
}
