//! # Merge — Many Concurrent Producers, One Consumer
//!
//! **Real-world scenario**: request fan-out where every upstream element
//! spawns a sub-query and all responses funnel into one consumer.
//!
//! ```text
//! ┌──────────┐
//! │ producer │──┐
//! ├──────────┤  │   ┌───────┐         ┌──────────┐
//! │ producer │──┼──►│ merge │────────►│ consumer │
//! ├──────────┤  │   └───────┘  40K    └──────────┘
//! │ producer │──┘              msgs
//! └──────────┘
//! ```
//!
//! Producer threads persist across iterations and are woken through
//! zero-capacity start/done rendezvous channels. The channel baselines do
//! the same fan-in by hand: one thread per producer, all sending into a
//! single MPMC channel.

pub use crossbeam_channel::bounded as crossbeam_bounded;
pub use crossbeam_utils::thread::scope;
pub use test::Bencher;

use confluo::flat_map::FlatMap;
use confluo::flow::Publisher;
use confluo::source::{Mapped, Pipe, from_iter, pipe, range};
use confluo::testkit::TestSubscriber;

pub const PRODUCERS: usize = 4;
pub const PER_PRODUCER: usize = 10_000;

#[bench]
fn confluo_threaded_pipes(b: &mut Bencher) {
    let starts: Vec<_> = (0..PRODUCERS)
        .map(|_| crossbeam_bounded::<Pipe<u64>>(0))
        .collect();
    let (done_tx, done_rx) = crossbeam_bounded(0);

    scope(|s| {
        // Producer threads: each waits for a fresh pipe, floods it, ends it.
        for (_, start_rx) in &starts {
            let start_rx = start_rx.clone();
            let done_tx = done_tx.clone();
            s.spawn(move |_| {
                while let Ok(p) = start_rx.recv() {
                    for i in 0..PER_PRODUCER {
                        let mut v = i as u64;
                        while let Err(back) = p.push(v) {
                            v = back;
                            std::hint::spin_loop();
                        }
                    }
                    p.complete();
                    done_tx.send(()).unwrap();
                }
            });
        }

        b.iter(|| {
            let pipes: Vec<_> = (0..PRODUCERS).map(|_| pipe::<u64>()).collect();
            let feeds = pipes.clone();
            let op = FlatMap::new(from_iter(0..PRODUCERS), move |i: &usize| {
                Ok(Mapped::stream(feeds[*i].clone()))
            })
            .max_concurrency(PRODUCERS);
            let ts = TestSubscriber::unbounded();
            op.subscribe(ts.clone());

            for (p, (start_tx, _)) in pipes.into_iter().zip(&starts) {
                start_tx.send(p).unwrap();
            }
            ts.await_terminal();
            for _ in 0..PRODUCERS {
                done_rx.recv().unwrap();
            }

            assert_eq!(ts.value_count(), PRODUCERS * PER_PRODUCER);
            test::black_box(ts.value_count());
        });

        for (start_tx, _) in starts {
            drop(start_tx);
        }
    })
    .unwrap();
}

/// Pure drain throughput: every inner is SYNC-fused, no producer threads.
#[bench]
fn confluo_sync_fused(b: &mut Bencher) {
    b.iter(|| {
        let op = FlatMap::new(range(0, PRODUCERS * PER_PRODUCER / 10), |v: &i64| {
            Ok(Mapped::stream(range(*v, 10)))
        });
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());
        assert_eq!(ts.value_count(), PRODUCERS * PER_PRODUCER);
        test::black_box(ts.value_count());
    });
}

#[bench]
fn flume_fan_in(b: &mut Bencher) {
    let (tx, rx) = flume::unbounded::<u64>();
    let (start_tx, start_rx) = crossbeam_bounded(0);
    let (done_tx, done_rx) = crossbeam_bounded(0);

    scope(|s| {
        for _ in 0..PRODUCERS {
            let tx = tx.clone();
            let start_rx = start_rx.clone();
            let done_tx = done_tx.clone();
            s.spawn(move |_| {
                while start_rx.recv().is_ok() {
                    for i in 0..PER_PRODUCER {
                        tx.send(i as u64).unwrap();
                    }
                    done_tx.send(()).unwrap();
                }
            });
        }

        b.iter(|| {
            for _ in 0..PRODUCERS {
                start_tx.send(()).unwrap();
            }
            for _ in 0..PRODUCERS * PER_PRODUCER {
                rx.recv().unwrap();
            }
            for _ in 0..PRODUCERS {
                done_rx.recv().unwrap();
            }
        });

        drop(start_tx);
    })
    .unwrap();
}

#[bench]
fn kanal_fan_in(b: &mut Bencher) {
    let (tx, rx) = kanal::unbounded::<u64>();
    let (start_tx, start_rx) = crossbeam_bounded(0);
    let (done_tx, done_rx) = crossbeam_bounded(0);

    scope(|s| {
        for _ in 0..PRODUCERS {
            let tx = tx.clone();
            let start_rx = start_rx.clone();
            let done_tx = done_tx.clone();
            s.spawn(move |_| {
                while start_rx.recv().is_ok() {
                    for i in 0..PER_PRODUCER {
                        tx.send(i as u64).unwrap();
                    }
                    done_tx.send(()).unwrap();
                }
            });
        }

        b.iter(|| {
            for _ in 0..PRODUCERS {
                start_tx.send(()).unwrap();
            }
            for _ in 0..PRODUCERS * PER_PRODUCER {
                rx.recv().unwrap();
            }
            for _ in 0..PRODUCERS {
                done_rx.recv().unwrap();
            }
        });

        drop(start_tx);
    })
    .unwrap();
}
