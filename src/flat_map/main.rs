use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::flat_map::inner::{Coordinator, FlatMapInner};
use crate::flat_map::slots::InnerSet;
use crate::flat_map::{ContinueHook, Mapper};
use crate::flow::{
    Demand, ErrorSlot, FlowError, Handle, Hooks, Subscriber, Subscription, UNBOUNDED,
};
use crate::probe::{Attr, AttrValue, Inspect};
use crate::queue::ScalarQueue;
use crate::source::Mapped;

/// Coordinator of one flat-map subscription.
///
/// Subscribes to the upstream, maps every element to an inner sequence,
/// and merges all concurrently active inners into the downstream under its
/// demand. All emission happens inside the wip-serialized
/// [`drain_loop`](Self::drain_loop); every other thread only deposits state
/// (queues, flags, the error slot) and bumps `wip`.
pub(crate) struct FlatMapMain<T: Send + 'static, R: Send + 'static> {
    downstream: Arc<dyn Subscriber<R>>,
    mapper: Mapper<T, R>,
    /// `usize::MAX` means no cap.
    max_concurrency: usize,
    prefetch: usize,
    delay_error: bool,
    error_continue: Option<ContinueHook<T>>,
    hooks: Hooks<R>,
    requested: Demand,
    /// Non-zero while a merge pass is running or queued. The pre-increment
    /// winner becomes the drainer; everyone else just signals.
    wip: CachePadded<AtomicUsize>,
    inners: InnerSet<R>,
    /// Created on the first scalar that cannot go out inline.
    scalar_queue: OnceLock<ScalarQueue<R>>,
    error: ErrorSlot,
    /// Upstream reached its terminal signal (or was cut by a failure).
    done: AtomicBool,
    cancelled: AtomicBool,
    upstream: OnceLock<Arc<dyn Subscription>>,
    /// Round-robin cursor: where the last pass ran out of demand.
    last_index: AtomicUsize,
    self_ref: OnceLock<Weak<Self>>,
}

impl<T: Send + 'static, R: Send + 'static> FlatMapMain<T, R> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        downstream: Arc<dyn Subscriber<R>>,
        mapper: Mapper<T, R>,
        max_concurrency: usize,
        prefetch: usize,
        delay_error: bool,
        error_continue: Option<ContinueHook<T>>,
        hooks: Hooks<R>,
    ) -> Arc<Self> {
        let main = Arc::new(Self {
            downstream,
            mapper,
            max_concurrency,
            prefetch,
            delay_error,
            error_continue,
            hooks,
            requested: Demand::new(),
            wip: CachePadded::new(AtomicUsize::new(0)),
            inners: InnerSet::new(),
            scalar_queue: OnceLock::new(),
            error: ErrorSlot::new(),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            upstream: OnceLock::new(),
            last_index: AtomicUsize::new(0),
            self_ref: OnceLock::new(),
        });
        let _ = main.self_ref.set(Arc::downgrade(&main));
        main
    }

    fn me(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn request_upstream(&self, n: u64) {
        if let Some(s) = self.upstream.get() {
            s.request(n);
        }
    }

    fn upstream_cancel(&self) {
        if let Some(s) = self.upstream.get() {
            s.cancel();
        }
    }

    fn scalar_queue(&self) -> &ScalarQueue<R> {
        self.scalar_queue.get_or_init(|| {
            if self.max_concurrency == usize::MAX {
                ScalarQueue::unbounded()
            } else {
                ScalarQueue::bounded(self.max_concurrency)
            }
        })
    }

    /// Deposits an error (or hands it to the dropped-error hook when the
    /// terminal slot is already closed).
    fn deposit_error(&self, err: FlowError) {
        if let Err(e) = self.error.push(err) {
            self.hooks.error_dropped(e);
        }
    }

    /// Fatal operator-level failure: cut the upstream, record, drain.
    fn fail_fast(&self, err: FlowError) {
        self.upstream_cancel();
        self.done.store(true, Ordering::Release);
        self.deposit_error(err);
        self.drain();
    }

    /// A mapper or callable failed for `element`.
    fn mapper_failed(&self, err: FlowError, element: T) {
        match &self.error_continue {
            Some(hook) => {
                hook(err, Some(element));
                self.request_upstream(1);
            }
            None => {
                drop(element);
                self.fail_fast(err);
            }
        }
    }

    /// An inner sequence failed: recoverable under continue mode (the
    /// element is unknown here), terminal otherwise.
    fn note_inner_failure(&self, err: FlowError) {
        match &self.error_continue {
            Some(hook) => hook(err, None),
            None => self.deposit_error(err),
        }
    }

    /// Scalar fast path: try to short-cut the queue entirely.
    ///
    /// Taking `wip` 0→1 with demand available means no drain is running and
    /// nothing is buffered ahead of this value, so it may go out inline.
    /// Anything else parks it in the scalar queue.
    fn try_emit_scalar(&self, value: R) {
        if self
            .wip
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if self.is_cancelled() {
                self.hooks.discard(value);
            } else if self.requested.get() > 0 {
                self.downstream.on_next(value);
                self.requested.sub(1);
                self.request_upstream(1);
            } else if let Err(value) = self.scalar_queue().push(value) {
                self.hooks.discard(value);
                self.overflow();
            }
            self.drain_loop();
        } else {
            match self.scalar_queue().push(value) {
                Ok(()) => self.drain(),
                Err(value) => {
                    self.hooks.discard(value);
                    self.overflow();
                }
            }
        }
    }

    fn overflow(&self) {
        self.upstream_cancel();
        self.done.store(true, Ordering::Release);
        self.deposit_error(FlowError::overflow());
        self.drain();
    }

    pub(crate) fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_loop();
        }
    }

    /// The serialized merge pass. Entered only with `wip` ownership; once a
    /// terminal signal went downstream it returns without releasing `wip`,
    /// which permanently parks every later drain attempt.
    fn drain_loop(&self) {
        loop {
            if self.is_cancelled() {
                self.discard_everything();
                return;
            }
            if !self.delay_error && self.error.is_set() {
                self.terminate_with_error();
                return;
            }

            let mut replenish = 0u64;
            let mut r = self.requested.get();

            // Scalar results first, up to available demand.
            if let Some(q) = self.scalar_queue.get() {
                let mut emitted = 0u64;
                while emitted < r && !self.is_cancelled() {
                    match q.pop() {
                        Some(v) => {
                            self.downstream.on_next(v);
                            emitted += 1;
                        }
                        None => break,
                    }
                }
                if emitted > 0 {
                    self.requested.sub(emitted);
                    replenish += emitted;
                    r = self.requested.get();
                }
            }

            // Round-robin over the inner queues, starting where the last
            // pass ran out of demand. Each inner drains until empty or
            // demand is exhausted; terminated inners are reaped even on
            // zero-demand passes so completion detection can't stall.
            let n = self.inners.slot_count();
            if n > 0 {
                let mut j = self.last_index.load(Ordering::Relaxed);
                if j >= n {
                    j = 0;
                }
                // Where demand ran out; the next pass resumes there so a
                // half-drained inner is first in line.
                let mut resume = None;
                for _ in 0..n {
                    if self.is_cancelled() || (!self.delay_error && self.error.is_set()) {
                        break;
                    }
                    if let Some(inner) = self.inners.get(j) {
                        while r > 0 && !self.is_cancelled() {
                            match inner.poll() {
                                Ok(Some(v)) => {
                                    self.downstream.on_next(v);
                                    self.requested.sub(1);
                                    r -= 1;
                                    inner.count_emission();
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    inner.mark_done();
                                    inner.cancel();
                                    inner.discard_queue();
                                    self.note_inner_failure(e);
                                    break;
                                }
                            }
                        }
                        if r == 0 && resume.is_none() {
                            resume = Some(j);
                        }
                        if inner.is_done() && inner.queue_empty() {
                            self.inners.remove(j);
                            replenish += 1;
                        }
                    }
                    j += 1;
                    if j == n {
                        j = 0;
                    }
                }
                self.last_index.store(resume.unwrap_or(j), Ordering::Relaxed);
            }

            // Terminal detection: upstream finished and nothing is buffered
            // anywhere.
            if self.done.load(Ordering::Acquire)
                && !self.is_cancelled()
                && self.scalar_queue.get().is_none_or(ScalarQueue::is_empty)
                && self.inners.is_devoid()
            {
                match self.error.take() {
                    Some(e) => self.downstream.on_error(e),
                    None => self.downstream.on_complete(),
                }
                return;
            }

            if replenish > 0 && !self.done.load(Ordering::Acquire) && !self.is_cancelled() {
                self.request_upstream(replenish);
            }

            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }

    /// Immediate-mode error: cut everything, discard buffers, surface the
    /// composed error. Runs under `wip`.
    fn terminate_with_error(&self) {
        self.upstream_cancel();
        for inner in self.inners.take_all() {
            inner.cancel();
            inner.discard_queue();
        }
        if let Some(q) = self.scalar_queue.get() {
            while let Some(v) = q.pop() {
                self.hooks.discard(v);
            }
        }
        if let Some(e) = self.error.take() {
            self.downstream.on_error(e);
        }
    }

    /// Cancellation teardown. Runs under `wip`: the drain is the single
    /// consumer of every queue, so only it may discard them.
    fn discard_everything(&self) {
        for inner in self.inners.take_all() {
            inner.cancel();
            inner.discard_queue();
        }
        if let Some(q) = self.scalar_queue.get() {
            while let Some(v) = q.pop() {
                self.hooks.discard(v);
            }
        }
        // A pending error has nowhere to go after cancellation.
        if let Some(e) = self.error.take() {
            self.hooks.error_dropped(e);
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for FlatMapMain<T, R> {
    fn on_subscribe(&self, handle: Handle<T>) {
        let subscription = handle.subscription();
        if self.upstream.set(subscription).is_err() {
            handle.cancel();
            return;
        }
        if let Some(me) = self.me() {
            self.downstream.on_subscribe(Handle::Plain(me));
        }
        let initial = if self.max_concurrency == usize::MAX {
            UNBOUNDED
        } else {
            self.max_concurrency as u64
        };
        self.request_upstream(initial);
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            log::debug!("dropped upstream element signalled after termination");
            return;
        }
        match (self.mapper)(&item) {
            Err(e) => self.mapper_failed(e, item),
            Ok(Mapped::Value(v)) => self.try_emit_scalar(v),
            Ok(Mapped::Empty) => self.request_upstream(1),
            Ok(Mapped::Call(f)) => match f() {
                Ok(Some(v)) => self.try_emit_scalar(v),
                Ok(None) => self.request_upstream(1),
                Err(e) => self.mapper_failed(e, item),
            },
            Ok(Mapped::Stream(p)) => {
                let Some(me) = self.me() else { return };
                let inner = Arc::new(FlatMapInner::new(me, self.prefetch));
                if self.inners.add(inner.clone()) {
                    p.subscribe(inner);
                } else {
                    // The set closed (cancellation or terminal) before this
                    // element was admitted.
                    inner.cancel();
                }
            }
        }
    }

    fn on_error(&self, err: FlowError) {
        if self.done.swap(true, Ordering::AcqRel) {
            self.hooks.error_dropped(err);
            return;
        }
        self.deposit_error(err);
        self.drain();
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drain();
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscription for FlatMapMain<T, R> {
    fn request(&self, n: u64) {
        if n == 0 {
            self.deposit_error(FlowError::bad_request());
            self.drain();
            return;
        }
        self.requested.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream_cancel();
        // Cut the producers right away; queue teardown belongs to the drain.
        for inner in self.inners.close() {
            inner.cancel();
        }
        self.drain();
    }
}

impl<T: Send + 'static, R: Send + 'static> Coordinator<R> for FlatMapMain<T, R> {
    fn drain(&self) {
        FlatMapMain::drain(self);
    }

    fn inner_error(&self, err: FlowError) {
        self.note_inner_failure(err);
        self.drain();
    }

    fn error_dropped(&self, err: FlowError) {
        self.hooks.error_dropped(err);
    }

    fn item_dropped(&self, item: R) {
        self.hooks.item_dropped(item);
    }

    fn item_discarded(&self, item: R) {
        self.hooks.discard(item);
    }
}

impl<T: Send + 'static, R: Send + 'static> Inspect for FlatMapMain<T, R> {
    fn scan(&self, attr: Attr) -> Option<AttrValue> {
        match attr {
            Attr::Parent => Some(AttrValue::Flag(self.upstream.get().is_some())),
            Attr::Actual => Some(AttrValue::Flag(true)),
            Attr::RequestedFromDownstream => Some(AttrValue::Count(self.requested.get())),
            Attr::Prefetch => Some(AttrValue::Count(self.prefetch as u64)),
            Attr::Terminated => Some(AttrValue::Flag(self.error.is_terminated())),
            Attr::Cancelled => Some(AttrValue::Flag(self.is_cancelled())),
            Attr::Error => self.error.describe().map(AttrValue::Text),
            Attr::Buffered => {
                let scalars = self.scalar_queue.get().map_or(0, ScalarQueue::len) as u64;
                Some(AttrValue::Count(scalars.min(u32::MAX as u64)))
            }
            Attr::LargeBuffered => {
                let scalars = self.scalar_queue.get().map_or(0, ScalarQueue::len) as u64;
                Some(AttrValue::Count(scalars + self.inners.buffered() as u64))
            }
            Attr::DelayError => Some(AttrValue::Flag(self.delay_error)),
            Attr::RunStyle => Some(AttrValue::Text("sync".into())),
        }
    }
}
