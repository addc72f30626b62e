//! The reactive-streams seam the operator is built against.
//!
//! A [`Publisher`] pushes items into a [`Subscriber`] only after the
//! subscriber asked for them through its [`Subscription`]:
//!
//!```text
//! ┌───────────┐  on_subscribe(handle)  ┌────────────┐
//! │ Publisher │ ─────────────────────► │ Subscriber │
//! │           │ ◄───── request(n) ──── │            │
//! │           │ ── on_next × ≤n ─────► │            │
//! │           │ ── on_complete/error ► │            │
//! └───────────┘                        └────────────┘
//!```
//!
//! ## Contract
//!
//! - `on_subscribe` is called exactly once before any other signal; a
//!   redundant handle must be cancelled and dropped by the receiver.
//! - `on_next` is called at most once per requested item, serially.
//! - `on_error` / `on_complete` are terminal, mutually exclusive, at most
//!   once; late stragglers go to the [`Hooks`], never downstream.
//! - `request(0)` is a contract violation answered with
//!   [`FlowError::bad_request`].
//!
//! ## Fusion
//!
//! A producer that keeps its values in a queue anyway can skip per-element
//! signalling: it hands the consumer a [`FusedQueue`] inside
//! [`Handle::Fused`] and the consumer negotiates a [`FuseMode`] with
//! [`FusedQueue::request_fusion`].
//!
//! - [`FuseMode::Sync`]: the queue is fully populated at subscribe time; the
//!   consumer polls it dry and never calls `request`.
//! - [`FuseMode::Async`]: the producer keeps enqueueing and nudges the
//!   consumer with [`Subscriber::on_ready`] (a plain wake-up: the item is
//!   already in the queue, so there is nothing to pass).

mod demand;
mod error;
mod hooks;

pub use demand::UNBOUNDED;
pub(crate) use demand::Demand;
pub use error::FlowError;
pub(crate) use error::ErrorSlot;
pub use hooks::Hooks;

use std::sync::Arc;

/// Downstream's handle on an active subscription.
pub trait Subscription: Send + Sync {
    /// Asks the producer for `n` more items. [`UNBOUNDED`] means infinite
    /// demand; `0` is a contract violation.
    fn request(&self, n: u64);

    /// Stops the flow. Idempotent; buffered items are discarded.
    fn cancel(&self);
}

/// Fusion handshake outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseMode {
    /// No fusion: values travel through `on_next`.
    None,
    /// Queue fully populated at subscribe time, no `request` signalling.
    Sync,
    /// Producer enqueues and wakes the consumer with `on_ready`.
    Async,
    /// Request-only: the consumer accepts whichever mode the producer
    /// grants. Never returned as a grant.
    Any,
}

/// A subscription whose producer exposes its internal queue to the consumer.
pub trait FusedQueue<T>: Subscription {
    /// Negotiates fusion. `requested` is the strongest mode the consumer can
    /// handle; the grant is [`FuseMode::None`], [`Sync`](FuseMode::Sync) or
    /// [`Async`](FuseMode::Async), never stronger than requested.
    fn request_fusion(&self, requested: FuseMode) -> FuseMode;

    /// Takes the next value out of the fused queue.
    ///
    /// An `Err` carries a producer-side failure surfaced through the queue
    /// (only possible for lazily evaluated SYNC sources).
    fn poll(&self) -> Result<Option<T>, FlowError>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;

    /// Drops everything still buffered. Called on cancellation.
    fn clear(&self);
}

/// What a subscriber receives during the handshake: either a plain
/// subscription or a fusion-capable one.
///
/// This tagged variant replaces capability probing by downcast: a producer
/// states what it is, the consumer matches.
pub enum Handle<T> {
    Plain(Arc<dyn Subscription>),
    Fused(Arc<dyn FusedQueue<T>>),
}

impl<T> Handle<T> {
    /// The plain subscription view of the handle, whatever its flavor.
    pub fn subscription(&self) -> Arc<dyn Subscription> {
        match self {
            Self::Plain(s) => s.clone(),
            Self::Fused(q) => {
                let s: Arc<dyn Subscription> = q.clone();
                s
            }
        }
    }

    pub fn cancel(&self) {
        match self {
            Self::Plain(s) => s.cancel(),
            Self::Fused(q) => q.cancel(),
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(s) => Self::Plain(s.clone()),
            Self::Fused(q) => Self::Fused(q.clone()),
        }
    }
}

/// Consumer of an asynchronous sequence.
pub trait Subscriber<T>: Send + Sync {
    /// Called exactly once, before any other signal.
    fn on_subscribe(&self, handle: Handle<T>);

    /// One item, previously requested.
    fn on_next(&self, item: T);

    /// ASYNC-fusion wake-up: the producer put a value in the fused queue.
    /// Default: ignore (meaningless without fusion).
    fn on_ready(&self) {}

    /// Terminal failure. Mutually exclusive with `on_complete`.
    fn on_error(&self, err: FlowError);

    /// Terminal success. Mutually exclusive with `on_error`.
    fn on_complete(&self);
}

/// Producer of an asynchronous sequence.
pub trait Publisher<T>: Send + Sync {
    /// Starts the flow towards `subscriber`. The producer must call
    /// `on_subscribe` exactly once before any other signal.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Owned, type-erased publisher, as returned by a flat-map mapper.
pub type BoxPublisher<T> = Box<dyn Publisher<T>>;
