//! Bridge from a [`Publisher`] into a [`futures::Stream`].
//!
//! The bridge subscribes with a bounded buffer, requests its capacity up
//! front and replenishes in batches of `capacity - capacity/4` as the
//! stream consumer drains it. Wake-ups go through an
//! [`AtomicWaker`](futures::task::AtomicWaker); after registering, the poll
//! double-checks the buffer so a value pushed concurrently cannot be missed.
//!
//! ## Example
//!
//!```
//! use confluo::flat_map::FlatMap;
//! use confluo::source::{range, Mapped};
//! use confluo::stream::SubscriberStream;
//! use futures::StreamExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let op = FlatMap::new(range(1, 10), |v: &i64| Ok(Mapped::value(*v)));
//! let mut values = SubscriberStream::new(&op, 4);
//!
//! let mut sum = 0;
//! while let Some(v) = values.next().await {
//!     sum += v.unwrap();
//! }
//! assert_eq!(sum, 55);
//! # }
//! ```

use std::pin::Pin;
use std::sync::{
    Arc, Mutex, OnceLock, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::task::{Context, Poll};

use futures::Stream;
use futures::task::AtomicWaker;

use crate::flow::{FlowError, Handle, Publisher, Subscriber, Subscription};
use crate::queue::SpscRing;

/// A [`Stream`] of the items a publisher emits.
///
/// Yields `Ok` items, then either ends (completion) or yields one final
/// `Err` (failure) and ends. Dropping the stream cancels the subscription.
pub struct SubscriberStream<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    buffer: SpscRing<T>,
    waker: AtomicWaker,
    subscription: OnceLock<Arc<dyn Subscription>>,
    error: Mutex<Option<FlowError>>,
    done: AtomicBool,
    /// Items consumed since the last replenish. Only the stream side
    /// touches this.
    consumed: AtomicUsize,
    capacity: usize,
    limit: usize,
}

impl<T: Send + 'static> SubscriberStream<T> {
    /// Subscribes to `publisher` with a buffer of `capacity` items.
    pub fn new(publisher: &impl Publisher<T>, capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        let shared = Arc::new(Shared {
            buffer: SpscRing::new(capacity),
            waker: AtomicWaker::new(),
            subscription: OnceLock::new(),
            error: Mutex::new(None),
            done: AtomicBool::new(false),
            consumed: AtomicUsize::new(0),
            capacity,
            limit: capacity - (capacity >> 2),
        });
        publisher.subscribe(shared.clone());
        Self { shared }
    }
}

impl<T: Send + 'static> Shared<T> {
    fn take_error(&self) -> Option<FlowError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn fail(&self, err: FlowError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.done.store(true, Ordering::Release);
    }

    /// Stream-side: one item left the buffer; ask the producer for the
    /// next batch once `limit` items are consumed.
    fn note_consumed(&self) {
        let consumed = self.consumed.load(Ordering::Relaxed) + 1;
        if consumed == self.limit {
            self.consumed.store(0, Ordering::Relaxed);
            if let Some(s) = self.subscription.get() {
                s.request(self.limit as u64);
            }
        } else {
            self.consumed.store(consumed, Ordering::Relaxed);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Shared<T> {
    fn on_subscribe(&self, handle: Handle<T>) {
        let subscription = handle.subscription();
        if self.subscription.set(subscription.clone()).is_err() {
            handle.cancel();
            return;
        }
        subscription.request(self.capacity as u64);
    }

    fn on_next(&self, item: T) {
        if self.buffer.push(item).is_err() {
            // The producer ignored its request budget.
            if let Some(s) = self.subscription.get() {
                s.cancel();
            }
            self.fail(FlowError::overflow());
        }
        self.waker.wake();
    }

    fn on_error(&self, err: FlowError) {
        self.fail(err);
        self.waker.wake();
    }

    fn on_complete(&self) {
        self.done.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Safe: the struct is not self-referential:
/// future fields are not pointing to other fields within the same struct
impl<T: Send + 'static> Unpin for SubscriberStream<T> {}

impl<T: Send + 'static> Stream for SubscriberStream<T> {
    type Item = Result<T, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let shared = &self.shared;

        if let Some(v) = shared.buffer.pop() {
            shared.note_consumed();
            return Poll::Ready(Some(Ok(v)));
        }

        if shared.done.load(Ordering::Acquire) {
            // Buffer drained: surface the terminal. A failure yields once,
            // the next poll falls through to the end of the stream.
            return match shared.take_error() {
                Some(e) => Poll::Ready(Some(Err(e))),
                None => Poll::Ready(None),
            };
        }

        // we store the waker for future polls
        self.shared.waker.register(cx.waker());

        // We give a second shot to see if we should be woken up immediately
        if !shared.buffer.is_empty() || shared.done.load(Ordering::Acquire) {
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

impl<T: Send + 'static> Drop for SubscriberStream<T> {
    fn drop(&mut self) {
        if let Some(s) = self.shared.subscription.get() {
            s.cancel();
        }
    }
}
