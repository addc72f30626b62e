//! Lock-free queues backing the merge.
//!
//! Two bounded power-of-two rings cover the hot paths:
//!
//! - [`SpscRing`]: one queue per active inner sequence. The inner's
//!   signalling thread produces, the drain consumes.
//! - [`MpscRing`]: the shared scalar queue. Any thread observing a scalar
//!   inner produces, the drain consumes.
//!
//! When concurrency is unbounded the scalar queue must never overflow, so it
//! falls back to a segmented unbounded MPSC ([`crossbeam_queue::SegQueue`]).

mod mpsc;
mod spsc;

pub(crate) use mpsc::MpscRing;
pub(crate) use spsc::SpscRing;

use crossbeam_queue::SegQueue;

/// The scalar queue behind the fast path: bounded when `max_concurrency`
/// caps how many upstream elements can be in flight, unbounded otherwise.
pub(crate) enum ScalarQueue<T> {
    Bounded(MpscRing<T>),
    Unbounded(SegQueue<T>),
}

impl<T> ScalarQueue<T> {
    pub(crate) fn bounded(capacity: usize) -> Self {
        Self::Bounded(MpscRing::new(capacity))
    }

    pub(crate) fn unbounded() -> Self {
        Self::Unbounded(SegQueue::new())
    }

    /// Pushes a value, returning it back on overflow (bounded flavor only).
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        match self {
            Self::Bounded(q) => q.push(value),
            Self::Unbounded(q) => {
                q.push(value);
                Ok(())
            }
        }
    }

    /// Consumer takes the next value, if any. Single consumer: the drain.
    pub(crate) fn pop(&self) -> Option<T> {
        match self {
            Self::Bounded(q) => q.pop(),
            Self::Unbounded(q) => q.pop(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Bounded(q) => q.is_empty(),
            Self::Unbounded(q) => q.is_empty(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Bounded(q) => q.len(),
            Self::Unbounded(q) => q.len(),
        }
    }
}
