use std::iter::Peekable;
use std::ops::Range;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::flow::{
    Demand, FlowError, FuseMode, FusedQueue, Handle, Publisher, Subscriber, Subscription,
};

/// Cold sequence over a cloneable iterable.
///
/// Each subscriber gets its own pass over the data, driven by demand. The
/// subscription grants SYNC fusion when asked: everything is synchronously
/// available, so a fused consumer just polls the iterator dry.
pub struct FromIter<I> {
    seed: I,
}

/// Creates a publisher emitting the items of `seed`, once per subscriber.
pub fn from_iter<I>(seed: I) -> FromIter<I>
where
    I: IntoIterator + Clone,
{
    FromIter { seed }
}

/// `count` consecutive integers starting at `start`.
pub fn range(start: i64, count: usize) -> FromIter<Range<i64>> {
    from_iter(start..start.saturating_add(count as i64))
}

impl<I> Publisher<I::Item> for FromIter<I>
where
    I: IntoIterator + Clone + Send + Sync,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        let sub = Arc::new(IterSubscription {
            iter: Mutex::new(self.seed.clone().into_iter().peekable()),
            downstream: subscriber.clone(),
            requested: Demand::new(),
            wip: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            fused: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Handle::Fused(sub));
    }
}

struct IterSubscription<I: Iterator> {
    iter: Mutex<Peekable<I>>,
    downstream: Arc<dyn Subscriber<I::Item>>,
    requested: Demand,
    /// Non-zero while an emission loop is running or queued.
    wip: AtomicUsize,
    cancelled: AtomicBool,
    done: AtomicBool,
    fused: AtomicBool,
}

impl<I: Iterator> IterSubscription<I> {
    fn iter(&self) -> MutexGuard<'_, Peekable<I>> {
        self.iter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminated(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire)
    }

    /// Demand-driven emission, serialized by `wip`.
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            let mut emitted = 0u64;
            let requested = self.requested.get();
            while emitted < requested && !self.terminated() {
                let next = self.iter().next();
                match next {
                    Some(v) => {
                        self.downstream.on_next(v);
                        emitted += 1;
                    }
                    None => {
                        self.done.store(true, Ordering::Release);
                        self.downstream.on_complete();
                        break;
                    }
                }
            }
            if emitted > 0 {
                self.requested.sub(emitted);
            }
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.done.swap(true, Ordering::AcqRel) {
                self.downstream.on_error(FlowError::bad_request());
            }
            return;
        }
        // A SYNC-fused consumer owns the queue and must not signal demand.
        if self.fused.load(Ordering::Relaxed) || self.terminated() {
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<I> FusedQueue<I::Item> for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send,
{
    fn request_fusion(&self, requested: FuseMode) -> FuseMode {
        match requested {
            FuseMode::Sync | FuseMode::Any => {
                self.fused.store(true, Ordering::Release);
                FuseMode::Sync
            }
            _ => FuseMode::None,
        }
    }

    fn poll(&self) -> Result<Option<I::Item>, FlowError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.iter().next())
    }

    fn is_empty(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.iter().peek().is_none()
    }

    fn len(&self) -> usize {
        if self.cancelled.load(Ordering::Acquire) {
            return 0;
        }
        self.iter().size_hint().0
    }

    fn clear(&self) {
        // Values are produced lazily: marking the pass cancelled is enough,
        // is_empty and poll report exhaustion from here on.
        self.cancelled.store(true, Ordering::Release);
    }
}
