//! The flat-map operator: map every upstream element to an inner sequence
//! and merge all active inners into one backpressured downstream sequence.
//!
//!```text
//!                    ┌─────────────► inner #0 ──► queue ─┐
//! upstream ─ mapper ─┼─────────────► inner #1 ──► queue ─┼─► drain ─► downstream
//!                    └─ scalar ────────────► scalar queue ┘     ▲
//!                                                               │
//!                                    downstream request(n) ─────┘
//!```
//!
//! ## Demand
//!
//! The operator asks the upstream for `max_concurrency` elements up front
//! and one replacement per retired element (a consumed scalar or a
//! terminated inner). Each inner is asked for `prefetch` values up front
//! and replenished in batches of `prefetch - prefetch/4`. The downstream
//! sees at most as many `on_next` signals as it requested, ever.
//!
//! ## Merging
//!
//! All emission funnels through one serialized drain pass (see
//! [`main`](self)): scalar results first, then the inner queues in round
//! robin starting where the previous pass ran out of demand, so no inner
//! starves under tight demand. Order across inners is unspecified; order
//! within one inner is preserved.
//!
//! ## Terminals
//!
//! By default the first error cuts everything and goes straight downstream.
//! With [`delay_error`](FlatMap::delay_error) the merge keeps delivering
//! buffered values from every sequence and surfaces the composed error only
//! once all of them finished. With
//! [`on_error_continue`](FlatMap::on_error_continue) recoverable failures
//! are handed to a user hook and the flow keeps going.
//!
//! ## Example
//!
//!```
//! use confluo::flat_map::FlatMap;
//! use confluo::source::{range, Mapped};
//! use confluo::flow::Publisher;
//! use confluo::testkit::TestSubscriber;
//!
//! let op = FlatMap::new(range(0, 3), |v: &i64| Ok(Mapped::stream(range(v * 10, 2))));
//! let ts = TestSubscriber::unbounded();
//! op.subscribe(ts.clone());
//!
//! let mut seen = ts.values();
//! seen.sort();
//! assert_eq!(seen, [0, 1, 10, 11, 20, 21]);
//! assert!(ts.is_complete());
//! ```

mod inner;
mod main;
mod slots;

use std::sync::Arc;

use crate::flow::{FlowError, Hooks, Publisher, Subscriber};
use crate::source::Mapped;

use main::FlatMapMain;

/// Default cap on concurrently subscribed inner sequences.
pub const DEFAULT_CONCURRENCY: usize = 256;

/// Default per-inner request batch.
pub const DEFAULT_PREFETCH: usize = 32;

/// Shared element-to-inner-sequence mapping function.
pub type Mapper<T, R> = Arc<dyn Fn(&T) -> Result<Mapped<R>, FlowError> + Send + Sync>;

/// Hook receiving recoverable failures under continue mode: the failed
/// element when it is known (mapper and callable failures), `None` for
/// inner-sequence failures.
pub type ContinueHook<T> = Arc<dyn Fn(FlowError, Option<T>) + Send + Sync>;

/// Builder and [`Publisher`] for the flat-map operator.
///
/// One `FlatMap` can be subscribed any number of times; each subscription
/// gets its own coordinator.
pub struct FlatMap<T: Send + 'static, R: Send + 'static> {
    source: Box<dyn Publisher<T>>,
    mapper: Mapper<T, R>,
    max_concurrency: usize,
    prefetch: usize,
    delay_error: bool,
    error_continue: Option<ContinueHook<T>>,
    hooks: Hooks<R>,
}

impl<T: Send + 'static, R: Send + 'static> FlatMap<T, R> {
    pub fn new(
        source: impl Publisher<T> + 'static,
        mapper: impl Fn(&T) -> Result<Mapped<R>, FlowError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: Box::new(source),
            mapper: Arc::new(mapper),
            max_concurrency: DEFAULT_CONCURRENCY,
            prefetch: DEFAULT_PREFETCH,
            delay_error: false,
            error_continue: None,
            hooks: Hooks::new(),
        }
    }

    /// Caps how many inner sequences may be subscribed at once. Also the
    /// upstream's in-flight element budget and the scalar queue bound.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        assert!(n >= 1, "max_concurrency must be positive");
        self.max_concurrency = n;
        self
    }

    /// Removes the concurrency cap: unbounded upstream demand and an
    /// unbounded scalar queue.
    pub fn unbounded_concurrency(mut self) -> Self {
        self.max_concurrency = usize::MAX;
        self
    }

    /// Per-inner request batch size.
    pub fn prefetch(mut self, n: usize) -> Self {
        assert!(n >= 1, "prefetch must be positive");
        self.prefetch = n;
        self
    }

    /// Delays errors until every sequence has delivered its buffered
    /// values; multiple failures are composed into one.
    pub fn delay_error(mut self, delay: bool) -> Self {
        self.delay_error = delay;
        self
    }

    /// Turns recoverable failures into hook calls instead of terminals:
    /// the offending element is dropped and one replacement is requested
    /// from the upstream.
    pub fn on_error_continue(
        mut self,
        hook: impl Fn(FlowError, Option<T>) + Send + Sync + 'static,
    ) -> Self {
        self.error_continue = Some(Arc::new(hook));
        self
    }

    /// Receivers for dropped and discarded signals.
    pub fn hooks(mut self, hooks: Hooks<R>) -> Self {
        self.hooks = hooks;
        self
    }
}

impl<T: Send + 'static, R: Send + 'static> Publisher<R> for FlatMap<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let main = FlatMapMain::new(
            subscriber,
            self.mapper.clone(),
            self.max_concurrency,
            self.prefetch,
            self.delay_error,
            self.error_continue.clone(),
            self.hooks.clone(),
        );
        self.source.subscribe(main);
    }
}

/// Flat-maps `source` through `mapper` with default settings.
pub fn flat_map<T: Send + 'static, R: Send + 'static>(
    source: impl Publisher<T> + 'static,
    mapper: impl Fn(&T) -> Result<Mapped<R>, FlowError> + Send + Sync + 'static,
) -> FlatMap<T, R> {
    FlatMap::new(source, mapper)
}

/// Flat-maps with error delivery delayed until all sequences finish.
pub fn flat_map_delay_error<T: Send + 'static, R: Send + 'static>(
    source: impl Publisher<T> + 'static,
    mapper: impl Fn(&T) -> Result<Mapped<R>, FlowError> + Send + Sync + 'static,
) -> FlatMap<T, R> {
    FlatMap::new(source, mapper).delay_error(true)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crossbeam_channel::bounded as crossbeam_bounded;

    use super::main::FlatMapMain;
    use super::*;
    use crate::flow::{Handle, Subscription};
    use crate::probe::{Attr, AttrValue, Inspect};
    use crate::source::{Pipe, fail, from_iter, pipe, range};
    use crate::testkit::{Defuse, RequestProbe, TestSubscriber};

    /// Subscription that ignores everything; for hand-rolled test sources.
    struct Inert;

    impl Subscription for Inert {
        fn request(&self, _n: u64) {}

        fn cancel(&self) {}
    }

    /// range(1, 1000) flat-mapped to two-element sequences under unbounded
    /// demand: 2000 values, then completion
    #[test]
    fn test_normal() {
        let op = FlatMap::new(range(1, 1000), |v: &i64| Ok(Mapped::stream(range(*v, 2))));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        let mut seen = ts.values();
        assert_eq!(seen.len(), 2000);
        seen.sort();
        let mut expected: Vec<i64> = (1..=1000).flat_map(|v| [v, v + 1]).collect();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(ts.is_complete());
        assert_eq!(ts.completion_count(), 1);
    }

    /// Demand gates delivery exactly: 1000 after the first request, 2000
    /// and completion after the second
    #[test]
    fn test_backpressured() {
        let op = FlatMap::new(range(1, 1000), |v: &i64| Ok(Mapped::stream(range(*v, 2))));
        let ts = TestSubscriber::new();
        op.subscribe(ts.clone());
        assert_eq!(ts.value_count(), 0);

        ts.request(1000);
        assert_eq!(ts.value_count(), 1000);
        assert!(!ts.is_terminated());

        ts.request(1000);
        assert_eq!(ts.value_count(), 2000);
        assert!(ts.is_complete());
    }

    /// The downstream never receives more than it asked for, at any point
    /// of an arbitrary request schedule
    #[test]
    fn test_demand_never_exceeded() {
        let op = FlatMap::new(range(1, 100), |v: &i64| Ok(Mapped::stream(range(*v, 2))));
        let ts = TestSubscriber::new();
        op.subscribe(ts.clone());

        let mut total = 0usize;
        for step in [3u64, 5, 7, 185] {
            ts.request(step);
            total += step as usize;
            assert_eq!(ts.value_count(), total.min(200));
        }
        assert!(ts.is_complete());
    }

    /// Scalar inners skip inner allocation: inline emission under demand,
    /// upstream order preserved
    #[test]
    fn test_scalar_inline() {
        let op = FlatMap::new(range(1, 50), |v: &i64| Ok(Mapped::value(*v * 2)));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        let expected: Vec<i64> = (1..=50).map(|v| v * 2).collect();
        assert_eq!(ts.values(), expected);
        assert!(ts.is_complete());
    }

    /// Scalars park in the shared queue while demand is zero and flush on
    /// request, one value per upstream element
    #[test]
    fn test_scalar_queued() {
        let op = FlatMap::new(range(1, 1000), |v: &i64| Ok(Mapped::value(*v)));
        let ts = TestSubscriber::new();
        op.subscribe(ts.clone());
        assert_eq!(ts.value_count(), 0);

        ts.request(1000);
        let expected: Vec<i64> = (1..=1000).collect();
        assert_eq!(ts.values(), expected);
        assert!(ts.is_complete());
    }

    /// Callables are evaluated once per element; an empty result just asks
    /// the upstream for a replacement
    #[test]
    fn test_callable() {
        let op = FlatMap::new(range(1, 10), |v: &i64| {
            let v = *v;
            if v % 2 == 0 {
                Ok(Mapped::call(move || Ok(Some(v * 10))))
            } else {
                Ok(Mapped::call(|| Ok(None)))
            }
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.values(), [20, 40, 60, 80, 100]);
        assert!(ts.is_complete());
    }

    /// A failing callable terminates like a failing mapper
    #[test]
    fn test_callable_error() {
        let op = FlatMap::new(range(1, 10), |_: &i64| {
            Ok(Mapped::<i64>::call(|| Err(FlowError::message("thunk"))))
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.value_count(), 0);
        assert_eq!(ts.error().as_deref(), Some("thunk"));
    }

    /// Empty scalars still replenish the upstream so the flow completes
    #[test]
    fn test_mapped_empty() {
        let op = FlatMap::new(range(1, 6), |v: &i64| {
            if v % 2 == 1 {
                Ok(Mapped::empty())
            } else {
                Ok(Mapped::value(*v))
            }
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.values(), [2, 4, 6]);
        assert!(ts.is_complete());
    }

    /// A mapper failure terminates the whole flow with that error and no
    /// values
    #[test]
    fn test_mapper_fails() {
        let op = FlatMap::new(from_iter([1, 2, 3]), |_: &i32| {
            Err::<Mapped<i32>, _>(FlowError::message("bad map"))
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.value_count(), 0);
        assert_eq!(ts.error().as_deref(), Some("bad map"));
        assert_eq!(ts.error_count(), 1);
    }

    /// An empty upstream completes immediately
    #[test]
    fn test_empty_upstream() {
        let op = FlatMap::new(from_iter(Vec::<i64>::new()), |v: &i64| Ok(Mapped::value(*v)));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());
        assert_eq!(ts.value_count(), 0);
        assert!(ts.is_complete());
    }

    /// Delay-error keeps delivering around a failed inner and surfaces the
    /// error last, per-inner order intact
    #[test]
    fn test_delay_error_interleaved() {
        let op = flat_map_delay_error(from_iter(0..3i64), |v: &i64| {
            Ok(match v {
                0 => Mapped::stream(from_iter([1i64, 2])),
                1 => Mapped::stream(fail("t")),
                _ => Mapped::stream(from_iter([3i64, 4])),
            })
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        let seen = ts.values();
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(sorted, [1, 2, 3, 4]);
        let pos = |v: i64| seen.iter().position(|x| *x == v).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(3) < pos(4));
        assert_eq!(ts.error().as_deref(), Some("t"));
    }

    /// Multiple delayed failures are composed into one terminal error
    #[test]
    fn test_delay_error_composite() {
        let op = flat_map_delay_error(from_iter(0..2i64), |v: &i64| {
            Ok(match v {
                0 => Mapped::<i64>::stream(fail("first")),
                _ => Mapped::<i64>::stream(fail("second")),
            })
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        let text = ts.error().unwrap();
        assert!(text.contains("first"), "{text}");
        assert!(text.contains("second"), "{text}");
    }

    /// Immediate mode: the first inner failure cuts everything
    #[test]
    fn test_immediate_error() {
        let op = FlatMap::new(from_iter(0..3i64), |v: &i64| {
            Ok(match v {
                1 => Mapped::stream(fail("t")),
                _ => Mapped::stream(from_iter([*v * 10, *v * 10 + 1])),
            })
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.error().as_deref(), Some("t"));
        assert_eq!(ts.error_count(), 1);
        assert!(!ts.is_complete());
    }

    /// Misbehaving upstream: two scalars against a budget of one, no
    /// demand to absorb them - terminal overflow
    #[test]
    fn test_overflow() {
        struct Rude;

        impl Publisher<i64> for Rude {
            fn subscribe(&self, s: Arc<dyn Subscriber<i64>>) {
                s.on_subscribe(Handle::Plain(Arc::new(Inert)));
                s.on_next(1);
                s.on_next(2);
            }
        }

        let discarded: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let d = discarded.clone();
        let op = FlatMap::new(Rude, |v: &i64| Ok(Mapped::value(*v)))
            .max_concurrency(1)
            .hooks(Hooks::new().on_discard(move |v| d.lock().unwrap().push(v)));
        let ts = TestSubscriber::new();
        op.subscribe(ts.clone());

        let err = ts.take_error().expect("overflow must terminate");
        assert!(err.is_overflow());
        assert_eq!(discarded.lock().unwrap().as_slice(), [2]);
    }

    /// request(0) violates the contract and terminates with bad-request
    #[test]
    fn test_bad_request() {
        let op = FlatMap::new(range(1, 5), |v: &i64| Ok(Mapped::value(*v)));
        let ts = TestSubscriber::new();
        op.subscribe(ts.clone());
        ts.request(0);
        assert!(ts.error().is_some_and(|e| e.contains("non-positive")));
    }

    /// Cancellation discards buffered values through the hook and nothing
    /// is emitted afterwards
    #[test]
    fn test_cancel_discards() {
        let discarded: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let d = discarded.clone();

        let p = pipe::<i64>();
        let p_inner = p.clone();
        let op = FlatMap::new(from_iter([0u8]), move |_: &u8| {
            Ok(Mapped::stream(p_inner.clone()))
        })
        .hooks(Hooks::new().on_discard(move |v| d.lock().unwrap().push(v)));
        let ts = TestSubscriber::with_demand(1);
        op.subscribe(ts.clone());

        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(ts.values(), [1]);

        ts.cancel();
        assert_eq!(discarded.lock().unwrap().as_slice(), [2]);
        assert_eq!(p.push(3), Err(3), "producer must see the cancellation");
        assert_eq!(ts.value_count(), 1);
        assert!(!ts.is_terminated());
    }

    /// A SYNC-fused inner producer never receives a request signal
    #[test]
    fn test_sync_fused_never_requested() {
        let probe = RequestProbe::new(from_iter(vec![1i64, 2, 3]));
        let counts = probe.counts();
        let cell = Mutex::new(Some(probe));
        let op = FlatMap::new(from_iter([0u8]), move |_: &u8| {
            Ok(Mapped::stream(cell.lock().unwrap().take().expect("single element")))
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.values(), [1, 2, 3]);
        assert!(ts.is_complete());
        assert_eq!(counts.request_calls(), 0);
    }

    /// An unfused inner is driven by prefetch batches: an initial request,
    /// then replenishes as values are consumed
    #[test]
    fn test_unfused_inner_replenish() {
        let probe = RequestProbe::new(Defuse::new(range(0, 100)));
        let counts = probe.counts();
        let cell = Mutex::new(Some(probe));
        let op = FlatMap::new(from_iter([0u8]), move |_: &u8| {
            Ok(Mapped::stream(cell.lock().unwrap().take().expect("single element")))
        })
        .prefetch(8);
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.value_count(), 100);
        assert!(ts.is_complete());
        assert!(counts.request_calls() > 1, "replenish batching expected");
        assert!(counts.total_requested() >= 100);
    }

    /// Continue mode: a mapper failure is reported with its element, the
    /// flow skips it and completes
    #[test]
    fn test_continue_mapper() {
        let seen: Arc<Mutex<Vec<(String, Option<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let op = FlatMap::new(from_iter([1i64, 2, 3]), |v: &i64| {
            if *v == 2 {
                Err(FlowError::message("skip me"))
            } else {
                Ok(Mapped::value(*v * 10))
            }
        })
        .on_error_continue(move |e, elem| s.lock().unwrap().push((e.to_string(), elem)));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.values(), [10, 30]);
        assert!(ts.is_complete());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("skip me".to_string(), Some(2))]
        );
    }

    /// Continue mode: an inner failure has no element to report; the flow
    /// keeps merging the other inners
    #[test]
    fn test_continue_inner() {
        let seen: Arc<Mutex<Vec<(String, Option<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let op = FlatMap::new(from_iter(0..3i64), |v: &i64| {
            Ok(match v {
                1 => Mapped::stream(fail("inner down")),
                _ => Mapped::stream(from_iter([*v * 10])),
            })
        })
        .on_error_continue(move |e, elem| s.lock().unwrap().push((e.to_string(), elem)));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        let mut values = ts.values();
        values.sort();
        assert_eq!(values, [0, 20]);
        assert!(ts.is_complete());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [("inner down".to_string(), None)]
        );
    }

    /// An inner signalling error after complete has the straggler dropped
    /// via the hook, never surfaced
    #[test]
    fn test_double_terminal_inner() {
        struct DoubleTerminal;

        impl Publisher<i64> for DoubleTerminal {
            fn subscribe(&self, s: Arc<dyn Subscriber<i64>>) {
                s.on_subscribe(Handle::Plain(Arc::new(Inert)));
                s.on_next(1);
                s.on_complete();
                s.on_error(FlowError::message("late"));
            }
        }

        let dropped: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let d = dropped.clone();
        let op = FlatMap::new(from_iter([0u8]), |_: &u8| Ok(Mapped::stream(DoubleTerminal)))
            .hooks(Hooks::new().on_error_dropped(move |e| d.lock().unwrap().push(e.to_string())));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        assert_eq!(ts.values(), [1]);
        assert!(ts.is_complete());
        assert_eq!(ts.error_count(), 0);
        assert_eq!(dropped.lock().unwrap().as_slice(), ["late"]);
    }

    /// Complete/error race between two inners: exactly one terminal; a
    /// losing error goes to the dropped-error hook
    #[test]
    fn test_terminal_race() {
        let _ = env_logger::builder().is_test(true).try_init();

        // Two persistent workers fed through zero-capacity rendezvous
        // channels: each send wakes its worker right at the signalling
        // point, and the two terminals race from there.
        let (complete_tx, complete_rx) = crossbeam_bounded::<Pipe<i64>>(0);
        let (fail_tx, fail_rx) = crossbeam_bounded::<Pipe<i64>>(0);
        let (done_tx, done_rx) = crossbeam_bounded::<()>(0);

        let completer_done = done_tx.clone();
        let completer = std::thread::spawn(move || {
            while let Ok(p) = complete_rx.recv() {
                p.complete();
                completer_done.send(()).unwrap();
            }
        });
        let failer = std::thread::spawn(move || {
            while let Ok(p) = fail_rx.recv() {
                p.fail(FlowError::message("t"));
                done_tx.send(()).unwrap();
            }
        });

        for round in 0..200 {
            let p0 = pipe::<i64>();
            let p1 = pipe::<i64>();
            let dropped: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
            let d = dropped.clone();

            let pipes = [p0.clone(), p1.clone()];
            let op = FlatMap::new(from_iter([0usize, 1]), move |i: &usize| {
                Ok(Mapped::stream(pipes[*i].clone()))
            })
            .max_concurrency(2)
            .hooks(Hooks::new().on_error_dropped(move |e| d.lock().unwrap().push(e.to_string())));
            let ts = TestSubscriber::unbounded();
            op.subscribe(ts.clone());

            // Alternate which side gets the head start across rounds.
            if round % 2 == 0 {
                complete_tx.send(p0).unwrap();
                fail_tx.send(p1).unwrap();
            } else {
                fail_tx.send(p1).unwrap();
                complete_tx.send(p0).unwrap();
            }
            done_rx.recv().unwrap();
            done_rx.recv().unwrap();
            ts.await_terminal();

            assert_eq!(ts.completion_count() + ts.error_count(), 1);
            if ts.is_complete() {
                assert!(
                    dropped.lock().unwrap().iter().any(|e| e.contains("t")),
                    "losing error must reach the dropped-error hook"
                );
            }
        }

        drop(complete_tx);
        drop(fail_tx);
        completer.join().unwrap();
        failer.join().unwrap();
    }

    /// Concurrent producers: every value delivered exactly once, per-inner
    /// order preserved
    #[test]
    fn test_threaded_conservation() {
        const PER_PRODUCER: i64 = 250;
        let producers = num_cpus::get().clamp(2, 8);

        let pipes: Vec<_> = (0..producers).map(|_| pipe::<i64>()).collect();
        let feeds = pipes.clone();
        let op = FlatMap::new(from_iter(0..producers), move |i: &usize| {
            Ok(Mapped::stream(feeds[*i].clone()))
        })
        .max_concurrency(producers);
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        let mut handles = Vec::new();
        for (p, feed) in pipes.into_iter().enumerate() {
            handles.push(std::thread::spawn(move || {
                let base = p as i64 * 1000;
                for i in 0..PER_PRODUCER {
                    let mut v = base + i;
                    while let Err(back) = feed.push(v) {
                        v = back;
                        std::thread::yield_now();
                    }
                }
                feed.complete();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        ts.await_count(producers * PER_PRODUCER as usize);
        ts.await_terminal();
        assert!(ts.is_complete());

        let seen = ts.values();
        assert_eq!(seen.len(), producers * PER_PRODUCER as usize);
        for p in 0..producers {
            let base = p as i64 * 1000;
            let ours: Vec<i64> = seen
                .iter()
                .copied()
                .filter(|v| (base..base + PER_PRODUCER).contains(v))
                .collect();
            let expected: Vec<i64> = (base..base + PER_PRODUCER).collect();
            assert_eq!(ours, expected, "per-inner order broken for producer {p}");
        }
    }

    /// Tight demand under concurrent production: delivery stops exactly at
    /// the requested amount
    #[test]
    fn test_threaded_demand_cap() {
        let p = pipe::<i64>();
        let feed = p.clone();
        let op = FlatMap::new(from_iter([0u8]), move |_: &u8| {
            Ok(Mapped::stream(feed.clone()))
        });
        let ts = TestSubscriber::with_demand(100);
        op.subscribe(ts.clone());

        let producer = std::thread::spawn(move || {
            for i in 0..500 {
                let mut v = i;
                while let Err(back) = p.push(v) {
                    v = back;
                    std::thread::yield_now();
                }
            }
        });
        producer.join().unwrap();

        ts.await_count(100);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(ts.value_count(), 100);
        assert!(!ts.is_terminated());
    }

    /// Coordinator state is scannable
    #[test]
    fn test_introspection() {
        let ts = TestSubscriber::new();
        let mapper: Mapper<i64, i64> = Arc::new(|v: &i64| Ok(Mapped::value(*v)));
        let main = FlatMapMain::new(ts.clone(), mapper, 4, 8, false, None, Hooks::new());
        range(0, 2).subscribe(main.clone());

        assert_eq!(main.scan(Attr::Parent), Some(AttrValue::Flag(true)));
        assert_eq!(main.scan(Attr::Actual), Some(AttrValue::Flag(true)));
        assert_eq!(main.scan(Attr::Prefetch), Some(AttrValue::Count(8)));
        assert_eq!(main.scan(Attr::DelayError), Some(AttrValue::Flag(false)));
        assert_eq!(main.scan(Attr::Cancelled), Some(AttrValue::Flag(false)));
        assert_eq!(main.scan(Attr::Terminated), Some(AttrValue::Flag(false)));
        assert_eq!(main.scan(Attr::Buffered), Some(AttrValue::Count(2)));
        assert_eq!(main.scan(Attr::LargeBuffered), Some(AttrValue::Count(2)));
        assert_eq!(
            main.scan(Attr::RequestedFromDownstream),
            Some(AttrValue::Count(0))
        );

        ts.request(10);
        assert_eq!(ts.value_count(), 2);
        assert!(ts.is_complete());
        assert_eq!(main.scan(Attr::Terminated), Some(AttrValue::Flag(true)));
        assert_eq!(main.scan(Attr::Buffered), Some(AttrValue::Count(0)));
    }

    /// ASYNC-fused inner: pushes surface through on_ready nudges and the
    /// merge completes after the pipe does
    #[test]
    fn test_async_fused_inner() {
        let p = pipe::<i64>();
        let feed = p.clone();
        let op = FlatMap::new(from_iter([0u8]), move |_: &u8| {
            Ok(Mapped::stream(feed.clone()))
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());

        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(ts.values(), [1, 2]);
        assert!(!ts.is_terminated());

        p.push(3).unwrap();
        p.complete();
        assert_eq!(ts.values(), [1, 2, 3]);
        assert!(ts.is_complete());
    }
}
