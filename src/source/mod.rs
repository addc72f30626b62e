//! Sources: what a flat-map mapper returns, and the publishers used to
//! exercise the operator end to end.
//!
//! The mapper classifies its output itself via [`Mapped`] instead of the
//! consumer probing the publisher for capabilities: a scalar is a scalar
//! because the mapper said so.

mod fail;
mod iter;
mod pipe;

pub use fail::{fail, fail_with, Fail};
pub use iter::{from_iter, range, FromIter};
pub use pipe::{pipe, Pipe};

use crate::flow::{BoxPublisher, FlowError, Publisher};

/// A fallible, deferred scalar: produces zero or one value when invoked.
pub type ScalarThunk<T> = Box<dyn FnOnce() -> Result<Option<T>, FlowError> + Send>;

/// The inner sequence a mapper produced for one upstream element.
///
/// Scalar flavors ([`Value`](Mapped::Value), [`Empty`](Mapped::Empty),
/// [`Call`](Mapped::Call)) take the fast path: no inner subscriber is
/// allocated and the single value (if any) is emitted inline or parked in
/// the shared scalar queue. [`Stream`](Mapped::Stream) is the general case.
pub enum Mapped<T> {
    /// Exactly one value, available now.
    Value(T),
    /// No values at all.
    Empty,
    /// Zero or one value, computed on demand; may fail.
    Call(ScalarThunk<T>),
    /// An arbitrary inner sequence.
    Stream(BoxPublisher<T>),
}

impl<T> Mapped<T> {
    pub fn value(v: T) -> Self {
        Self::Value(v)
    }

    pub fn empty() -> Self {
        Self::Empty
    }

    pub fn call(f: impl FnOnce() -> Result<Option<T>, FlowError> + Send + 'static) -> Self {
        Self::Call(Box::new(f))
    }

    pub fn stream(p: impl Publisher<T> + 'static) -> Self {
        Self::Stream(Box::new(p))
    }
}
