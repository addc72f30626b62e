use std::sync::Arc;

use crate::flow::{FlowError, Handle, Publisher, Subscriber, Subscription};

/// Sequence that fails immediately after the handshake, emitting no values.
pub struct Fail<F> {
    make: F,
}

/// Creates a publisher failing every subscriber with a fresh error built by
/// `make`.
pub fn fail_with<F>(make: F) -> Fail<F>
where
    F: Fn() -> FlowError + Send + Sync,
{
    Fail { make }
}

/// Creates a publisher failing every subscriber with the given message.
pub fn fail(msg: impl Into<String>) -> Fail<impl Fn() -> FlowError + Send + Sync> {
    let msg = msg.into();
    fail_with(move || FlowError::message(msg.clone()))
}

impl<T, F> Publisher<T> for Fail<F>
where
    F: Fn() -> FlowError + Send + Sync,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Handle::Plain(Arc::new(Noop)));
        subscriber.on_error((self.make)());
    }
}

/// Subscription of an already-terminated sequence: nothing to do.
pub(crate) struct Noop;

impl Subscription for Noop {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}
