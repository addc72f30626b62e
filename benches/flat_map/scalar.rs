//! # Scalar Fast Path — One Value Per Element
//!
//! **Real-world scenario**: enrichment lookups that resolve synchronously,
//! the degenerate flat-map where every inner sequence is a single value.
//!
//! | Method | Behavior |
//! |--------|----------|
//! | inline | demand available: value goes straight downstream |
//! | queued | no demand: values park in the shared MPSC ring, flush on request |

pub use test::Bencher;

use confluo::flat_map::FlatMap;
use confluo::flow::Publisher;
use confluo::source::{Mapped, range};
use confluo::testkit::TestSubscriber;

pub const TOTAL: usize = 100_000;

#[bench]
fn scalar_inline(b: &mut Bencher) {
    b.iter(|| {
        let op = FlatMap::new(range(0, TOTAL), |v: &i64| Ok(Mapped::value(*v)));
        let ts = TestSubscriber::unbounded();
        op.subscribe(ts.clone());
        assert_eq!(ts.value_count(), TOTAL);
        test::black_box(ts.value_count());
    });
}

#[bench]
fn scalar_queued_flush(b: &mut Bencher) {
    b.iter(|| {
        let op = FlatMap::new(range(0, TOTAL), |v: &i64| Ok(Mapped::value(*v)));
        let ts = TestSubscriber::new();
        op.subscribe(ts.clone());
        ts.request(TOTAL as u64);
        assert_eq!(ts.value_count(), TOTAL);
        test::black_box(ts.value_count());
    });
}
