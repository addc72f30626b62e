use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::ring::RingBuffer;

/// Bounded lock-free SPSC queue backing one inner sequence.
///
/// The producer is the inner's signalling thread (one signal at a time by
/// contract), the consumer is whichever thread currently owns the drain:
/// one logical producer, one logical consumer.
///
/// Synchronization follows the cursor protocol:
///
/// | Operation | Memory Ordering | Purpose |
/// |-----------|-----------------|---------|
/// | Read own cursor | `Relaxed` | Only one side modifies it |
/// | Read other's cursor | `Acquire` | See their writes to the buffer |
/// | Write own cursor | `Release` | Make buffer writes visible |
///
/// - Buffer full: `tail - head >= capacity`
/// - Buffer empty: `tail == head`
pub(crate) struct SpscRing<T> {
    buffer: RingBuffer<T>,
    /// Consumer's cursor - only advanced by the drain, read by the producer.
    head: CachePadded<AtomicUsize>,
    /// Producer's cursor - only advanced by the producer, read by the drain.
    tail: CachePadded<AtomicUsize>,
}

impl<T> SpscRing<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(capacity),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Producer pushes a new value in the buffer.
    ///
    /// Returns the value back when the buffer is full so the caller can turn
    /// it into an overflow signal without losing it.
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        // Single producer: the only one controlling the tail
        let tail = self.tail.load(Ordering::Relaxed);

        // acquire-load: observe all reads performed by the consumer via release-store
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.buffer.capacity() {
            return Err(value);
        }

        let i = self.buffer.index(tail);

        // # Safety
        //
        // The cursor arithmetic above guarantees the cell at `i` was already
        // consumed (or never written), so writing cannot leak a value.
        unsafe { self.buffer.write(i, value) };

        // release-store: make sure that acquire-loads see also the previous writings on the buffer
        self.tail.store(tail.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Consumer takes the next value out of the buffer, if any.
    pub(crate) fn pop(&self) -> Option<T> {
        // Single consumer: the only one controlling the head
        let head = self.head.load(Ordering::Relaxed);

        // acquire-load: observe all writes performed by the producer via release-store
        let tail = self.tail.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let i = self.buffer.index(head);

        // Safety: head < tail, so the cell is initialized and this is the
        // only read of it (the head advances right after).
        let out = unsafe { self.buffer.read(i) };

        // release-store: make sure that acquire-loads see also the previous readings on the buffer
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

unsafe impl<T: Send> Sync for SpscRing<T> {}
unsafe impl<T: Send> Send for SpscRing<T> {}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        // Safe using `get_mut`-style reads: &mut self guarantees exclusive
        // access and the owning Arc's drop synchronized with all Release stores.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head);
        for s in 0..count {
            let i = self.buffer.index(head.wrapping_add(s));
            // Safe: these cells are initialized (producer wrote, consumer didn't read)
            unsafe { self.buffer.drop_in_place(i) };
        }
    }
}
