//! Test instruments: a recording subscriber and a request-counting probe.
//!
//! These are assertion helpers, so unlike the rest of the crate they panic
//! freely (on lock poisoning, await timeouts, use before subscribe).

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use crate::flow::{
    FlowError, FuseMode, FusedQueue, Handle, Publisher, Subscriber, Subscription,
};

const AWAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriber that records everything it is signalled.
///
/// Demand is under test control: [`new`](Self::new) starts with none,
/// [`with_demand`](Self::with_demand) / [`unbounded`](Self::unbounded)
/// request at subscribe time, [`request`](Self::request) adds later.
pub struct TestSubscriber<T> {
    initial_demand: u64,
    fusion: Option<FuseMode>,
    handle: Mutex<Option<Handle<T>>>,
    granted: Mutex<Option<FuseMode>>,
    values: Mutex<Vec<T>>,
    error: Mutex<Option<FlowError>>,
    completions: AtomicUsize,
    errors: AtomicUsize,
    ready: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl<T: Send + 'static> TestSubscriber<T> {
    fn build(initial_demand: u64, fusion: Option<FuseMode>) -> Arc<Self> {
        Arc::new(Self {
            initial_demand,
            fusion,
            handle: Mutex::new(None),
            granted: Mutex::new(None),
            values: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            completions: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            ready: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        })
    }

    /// No demand until [`request`](Self::request) is called.
    pub fn new() -> Arc<Self> {
        Self::build(0, None)
    }

    /// Requests `n` as soon as the subscription arrives.
    pub fn with_demand(n: u64) -> Arc<Self> {
        Self::build(n, None)
    }

    /// Requests infinite demand as soon as the subscription arrives.
    pub fn unbounded() -> Arc<Self> {
        Self::build(crate::flow::UNBOUNDED, None)
    }

    /// Negotiates fusion at subscribe time instead of requesting demand.
    pub fn fused(requested: FuseMode) -> Arc<Self> {
        Self::build(0, Some(requested))
    }

    fn with_handle<R>(&self, f: impl FnOnce(&Handle<T>) -> R) -> R {
        let guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_ref().expect("not subscribed yet"))
    }

    pub fn request(&self, n: u64) {
        self.with_handle(|h| h.subscription().request(n));
    }

    pub fn cancel(&self) {
        self.with_handle(|h| h.cancel());
    }

    pub fn value_count(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drains the recorded values out of the subscriber.
    pub fn take_values(&self) -> Vec<T> {
        std::mem::take(&mut *self.values.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_complete(&self) -> bool {
        self.completions.load(Ordering::Acquire) > 0
    }

    pub fn is_terminated(&self) -> bool {
        self.is_complete() || self.errors.load(Ordering::Acquire) > 0
    }

    /// The recorded error, rendered. `None` when no error arrived.
    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(FlowError::to_string)
    }

    pub fn take_error(&self) -> Option<FlowError> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// How many terminal completions arrived (must stay ≤ 1).
    pub fn completion_count(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    /// How many terminal errors arrived (must stay ≤ 1).
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Acquire)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Acquire)
    }

    /// The fusion mode granted at subscribe, if fusion was requested.
    pub fn granted_mode(&self) -> Option<FuseMode> {
        *self.granted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The fused queue handle, when the producer offered one.
    pub fn fused_queue(&self) -> Option<Arc<dyn FusedQueue<T>>> {
        let guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(Handle::Fused(q)) => Some(q.clone()),
            _ => None,
        }
    }

    /// Spins until at least `n` values arrived. Panics after 5s.
    pub fn await_count(&self, n: usize) {
        let deadline = Instant::now() + AWAIT_TIMEOUT;
        while self.value_count() < n {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {n} values, got {}",
                self.value_count()
            );
            std::thread::yield_now();
        }
    }

    /// Spins until a terminal signal arrived. Panics after 5s.
    pub fn await_terminal(&self) {
        let deadline = Instant::now() + AWAIT_TIMEOUT;
        while !self.is_terminated() {
            assert!(Instant::now() < deadline, "timed out waiting for terminal");
            std::thread::yield_now();
        }
    }
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
    /// Snapshot of the values received so far.
    pub fn values(&self) -> Vec<T> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, handle: Handle<T>) {
        if self.subscriptions.fetch_add(1, Ordering::AcqRel) > 0 {
            // Contract: redundant subscriptions are cancelled and dropped.
            handle.cancel();
            return;
        }
        if let (Some(req), Handle::Fused(q)) = (self.fusion, &handle) {
            let granted = q.request_fusion(req);
            *self.granted.lock().unwrap_or_else(PoisonError::into_inner) = Some(granted);
        }
        let subscription = handle.subscription();
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        if self.initial_demand > 0 {
            subscription.request(self.initial_demand);
        }
    }

    fn on_next(&self, item: T) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    fn on_ready(&self) {
        self.ready.fetch_add(1, Ordering::AcqRel);
    }

    fn on_error(&self, err: FlowError) {
        let mut guard = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(err);
        }
        self.errors.fetch_add(1, Ordering::AcqRel);
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::AcqRel);
    }
}

/// Wraps a publisher and counts the demand signals its subscription
/// receives, fusion-transparently.
///
/// The key instrument for the fusion contract: a SYNC-fused producer must
/// never see a `request`.
pub struct RequestProbe<T> {
    inner: Box<dyn Publisher<T>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    request_calls: AtomicU64,
    total_requested: AtomicU64,
    cancel_calls: AtomicU64,
}

impl<T: Send + 'static> RequestProbe<T> {
    pub fn new(inner: impl Publisher<T> + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            counters: Arc::new(Counters::default()),
        }
    }

    /// A handle on the counters that outlives the probe, for when the probe
    /// itself is moved into an operator.
    pub fn counts(&self) -> ProbeCounts {
        ProbeCounts(self.counters.clone())
    }

    /// How many times `request` reached the producer.
    pub fn request_calls(&self) -> u64 {
        self.counters.request_calls.load(Ordering::Acquire)
    }

    /// Sum of all requested amounts.
    pub fn total_requested(&self) -> u64 {
        self.counters.total_requested.load(Ordering::Acquire)
    }

    pub fn cancel_calls(&self) -> u64 {
        self.counters.cancel_calls.load(Ordering::Acquire)
    }
}

/// Detached view of a [`RequestProbe`]'s counters.
#[derive(Clone)]
pub struct ProbeCounts(Arc<Counters>);

impl ProbeCounts {
    pub fn request_calls(&self) -> u64 {
        self.0.request_calls.load(Ordering::Acquire)
    }

    pub fn total_requested(&self) -> u64 {
        self.0.total_requested.load(Ordering::Acquire)
    }

    pub fn cancel_calls(&self) -> u64 {
        self.0.cancel_calls.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Publisher<T> for RequestProbe<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(Arc::new(ProbeSubscriber {
            actual: subscriber,
            counters: self.counters.clone(),
        }));
    }
}

struct ProbeSubscriber<T> {
    actual: Arc<dyn Subscriber<T>>,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> Subscriber<T> for ProbeSubscriber<T> {
    fn on_subscribe(&self, handle: Handle<T>) {
        let wrapped = match handle {
            Handle::Plain(s) => Handle::Plain(Arc::new(ProbeSubscription {
                inner: s,
                counters: self.counters.clone(),
            }) as Arc<dyn Subscription>),
            Handle::Fused(q) => Handle::Fused(Arc::new(ProbeFused {
                inner: q,
                counters: self.counters.clone(),
            }) as Arc<dyn FusedQueue<T>>),
        };
        self.actual.on_subscribe(wrapped);
    }

    fn on_next(&self, item: T) {
        self.actual.on_next(item);
    }

    fn on_ready(&self) {
        self.actual.on_ready();
    }

    fn on_error(&self, err: FlowError) {
        self.actual.on_error(err);
    }

    fn on_complete(&self) {
        self.actual.on_complete();
    }
}

struct ProbeSubscription {
    inner: Arc<dyn Subscription>,
    counters: Arc<Counters>,
}

impl Subscription for ProbeSubscription {
    fn request(&self, n: u64) {
        self.counters.request_calls.fetch_add(1, Ordering::AcqRel);
        self.counters.total_requested.fetch_add(n, Ordering::AcqRel);
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.counters.cancel_calls.fetch_add(1, Ordering::AcqRel);
        self.inner.cancel();
    }
}

struct ProbeFused<T> {
    inner: Arc<dyn FusedQueue<T>>,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> Subscription for ProbeFused<T> {
    fn request(&self, n: u64) {
        self.counters.request_calls.fetch_add(1, Ordering::AcqRel);
        self.counters.total_requested.fetch_add(n, Ordering::AcqRel);
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.counters.cancel_calls.fetch_add(1, Ordering::AcqRel);
        self.inner.cancel();
    }
}

impl<T: Send + 'static> FusedQueue<T> for ProbeFused<T> {
    fn request_fusion(&self, requested: FuseMode) -> FuseMode {
        self.inner.request_fusion(requested)
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        self.inner.poll()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn clear(&self) {
        self.inner.clear()
    }
}

/// Wraps a publisher and hides its fusion capability, forcing consumers
/// down the plain `request`/`on_next` path.
pub struct Defuse<T> {
    inner: Box<dyn Publisher<T>>,
}

impl<T: Send + 'static> Defuse<T> {
    pub fn new(inner: impl Publisher<T> + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for Defuse<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(Arc::new(DefusedSubscriber { actual: subscriber }));
    }
}

struct DefusedSubscriber<T> {
    actual: Arc<dyn Subscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for DefusedSubscriber<T> {
    fn on_subscribe(&self, handle: Handle<T>) {
        self.actual.on_subscribe(Handle::Plain(handle.subscription()));
    }

    fn on_next(&self, item: T) {
        self.actual.on_next(item);
    }

    fn on_ready(&self) {
        self.actual.on_ready();
    }

    fn on_error(&self, err: FlowError) {
        self.actual.on_error(err);
    }

    fn on_complete(&self) {
        self.actual.on_complete();
    }
}
