use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
};

use crate::flow::{FlowError, FuseMode, FusedQueue, Handle, Subscriber, Subscription};
use crate::probe::{Attr, AttrValue, Inspect};
use crate::queue::SpscRing;

/// What an inner needs from its coordinator. A trait seam keeps the inner
/// generic over the element type only, not over the coordinator's upstream
/// type and mapper.
pub(crate) trait Coordinator<R>: Send + Sync {
    /// Schedules (or runs) a merge pass.
    fn drain(&self);

    /// An inner sequence failed. The inner has already marked itself done.
    fn inner_error(&self, err: FlowError);

    /// An error was signalled after termination and has nowhere to go.
    fn error_dropped(&self, err: FlowError);

    /// A value was signalled after termination and has nowhere to go.
    fn item_dropped(&self, item: R);

    /// A buffered value is being thrown away.
    fn item_discarded(&self, item: R);
}

const MODE_NONE: u8 = 0;
const MODE_SYNC: u8 = 1;
const MODE_ASYNC: u8 = 2;

/// Subscriber attached to one inner sequence.
///
/// Buffers what the producer pushes (or adopts the producer's own queue
/// under fusion) and nudges the coordinator's drain; the drain does all the
/// emitting. Request accounting is batched: after `limit` consumed values
/// the producer is asked for `limit` more.
pub(crate) struct FlatMapInner<R: Send + 'static> {
    parent: Arc<dyn Coordinator<R>>,
    prefetch: usize,
    /// Replenish threshold: `prefetch - prefetch / 4`.
    limit: u64,
    /// Values consumed by the drain since the last replenish. Only the
    /// drain touches this, under the coordinator's wip serialization.
    produced: AtomicU64,
    subscription: OnceLock<Arc<dyn Subscription>>,
    /// The producer's queue, when fusion was granted.
    fused: OnceLock<Arc<dyn FusedQueue<R>>>,
    /// Own buffer, NONE mode only, created on first value.
    queue: OnceLock<SpscRing<R>>,
    mode: AtomicU8,
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl<R: Send + 'static> FlatMapInner<R> {
    pub(crate) fn new(parent: Arc<dyn Coordinator<R>>, prefetch: usize) -> Self {
        Self {
            parent,
            prefetch,
            limit: (prefetch - (prefetch >> 2)) as u64,
            produced: AtomicU64::new(0),
            subscription: OnceLock::new(),
            fused: OnceLock::new(),
            queue: OnceLock::new(),
            mode: AtomicU8::new(MODE_NONE),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Drain-side: takes the next buffered value.
    ///
    /// An `Err` is a producer failure surfaced through a fused queue.
    pub(crate) fn poll(&self) -> Result<Option<R>, FlowError> {
        if let Some(q) = self.fused.get() {
            q.poll()
        } else if let Some(q) = self.queue.get() {
            Ok(q.pop())
        } else {
            Ok(None)
        }
    }

    pub(crate) fn queue_empty(&self) -> bool {
        if let Some(q) = self.fused.get() {
            q.is_empty()
        } else if let Some(q) = self.queue.get() {
            q.is_empty()
        } else {
            true
        }
    }

    pub(crate) fn buffered(&self) -> usize {
        if let Some(q) = self.fused.get() {
            q.len()
        } else if let Some(q) = self.queue.get() {
            q.len()
        } else {
            0
        }
    }

    fn request_producer(&self, n: u64) {
        if let Some(s) = self.subscription.get() {
            s.request(n);
        } else if let Some(q) = self.fused.get() {
            q.request(n);
        }
    }

    /// Drain-side: one value went downstream; ask the producer for the next
    /// batch once `limit` values are consumed. SYNC-fused producers are
    /// never signalled.
    pub(crate) fn count_emission(&self) {
        if self.mode.load(Ordering::Acquire) == MODE_SYNC {
            return;
        }
        let produced = self.produced.load(Ordering::Relaxed) + 1;
        if produced == self.limit {
            self.produced.store(0, Ordering::Relaxed);
            self.request_producer(self.limit);
        } else {
            self.produced.store(produced, Ordering::Relaxed);
        }
    }

    /// Cuts the producer subscription once. Queue teardown stays with the
    /// drain.
    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(s) = self.subscription.get() {
            s.cancel();
        } else if let Some(q) = self.fused.get() {
            q.cancel();
        }
    }

    /// Drain-side: throws away everything still buffered, one discard
    /// signal per value.
    pub(crate) fn discard_queue(&self) {
        if let Some(q) = self.fused.get() {
            while let Ok(Some(v)) = q.poll() {
                self.parent.item_discarded(v);
            }
            q.clear();
        } else if let Some(q) = self.queue.get() {
            while let Some(v) = q.pop() {
                self.parent.item_discarded(v);
            }
        }
    }
}

impl<R: Send + 'static> Subscriber<R> for FlatMapInner<R> {
    fn on_subscribe(&self, handle: Handle<R>) {
        if self.cancelled.load(Ordering::Acquire)
            || self.subscription.get().is_some()
            || self.fused.get().is_some()
        {
            handle.cancel();
            return;
        }
        match handle {
            Handle::Fused(q) => match q.request_fusion(FuseMode::Any) {
                FuseMode::Sync => {
                    // Fully populated at subscribe: mark done and let the
                    // drain poll the queue dry. No request, ever.
                    let _ = self.fused.set(q);
                    self.mode.store(MODE_SYNC, Ordering::Release);
                    self.done.store(true, Ordering::Release);
                    self.parent.drain();
                }
                FuseMode::Async => {
                    let _ = self.fused.set(q.clone());
                    self.mode.store(MODE_ASYNC, Ordering::Release);
                    q.request(self.prefetch as u64);
                }
                _ => {
                    // Fusion refused: the handle still works as a plain
                    // subscription and values arrive via on_next.
                    let s: Arc<dyn Subscription> = q;
                    let _ = self.subscription.set(s.clone());
                    s.request(self.prefetch as u64);
                }
            },
            Handle::Plain(s) => {
                let _ = self.subscription.set(s.clone());
                s.request(self.prefetch as u64);
            }
        }
    }

    fn on_next(&self, item: R) {
        match self.mode.load(Ordering::Acquire) {
            MODE_ASYNC | MODE_SYNC => {
                // Fused producers deliver through their queue and wake with
                // on_ready; a value here is a stray.
                self.parent.item_dropped(item);
                self.parent.drain();
            }
            _ => {
                if self.is_done() || self.cancelled.load(Ordering::Acquire) {
                    self.parent.item_dropped(item);
                    return;
                }
                let q = self.queue.get_or_init(|| SpscRing::new(self.prefetch));
                match q.push(item) {
                    Ok(()) => self.parent.drain(),
                    Err(item) => {
                        // Producer ignored its request budget.
                        self.parent.item_discarded(item);
                        self.mark_done();
                        self.cancel();
                        self.parent.inner_error(FlowError::overflow());
                    }
                }
            }
        }
    }

    fn on_ready(&self) {
        self.parent.drain();
    }

    fn on_error(&self, err: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            // Double terminal: never surfaced downstream.
            self.parent.error_dropped(err);
            return;
        }
        self.parent.inner_error(err);
    }

    fn on_complete(&self) {
        self.mark_done();
        self.parent.drain();
    }
}

impl<R: Send + 'static> Inspect for FlatMapInner<R> {
    fn scan(&self, attr: Attr) -> Option<AttrValue> {
        match attr {
            Attr::Parent => Some(AttrValue::Flag(
                self.subscription.get().is_some() || self.fused.get().is_some(),
            )),
            Attr::Actual => Some(AttrValue::Flag(true)),
            Attr::Prefetch => Some(AttrValue::Count(self.prefetch as u64)),
            Attr::Terminated => Some(AttrValue::Flag(self.is_done())),
            Attr::Cancelled => Some(AttrValue::Flag(self.cancelled.load(Ordering::Acquire))),
            Attr::Buffered => Some(AttrValue::Count(
                (self.buffered() as u64).min(u32::MAX as u64),
            )),
            Attr::LargeBuffered => Some(AttrValue::Count(self.buffered() as u64)),
            Attr::RunStyle => Some(AttrValue::Text("sync".into())),
            _ => None,
        }
    }
}
