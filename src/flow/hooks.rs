use std::sync::Arc;

use crate::flow::FlowError;

/// Receivers for signals the operator is not allowed to deliver downstream.
///
/// Terminal races, cancellation and post-terminal stragglers all produce
/// signals with nowhere to go; per the subscriber contract they must be
/// dropped, but never silently. Unset hooks fall back to [`log`].
pub struct Hooks<T> {
    on_error_dropped: Option<Arc<dyn Fn(FlowError) + Send + Sync>>,
    on_item_dropped: Option<Arc<dyn Fn(T) + Send + Sync>>,
    on_discard: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

impl<T> Hooks<T> {
    pub fn new() -> Self {
        Self {
            on_error_dropped: None,
            on_item_dropped: None,
            on_discard: None,
        }
    }

    /// Called with errors that lost a terminal race or arrived after
    /// termination.
    pub fn on_error_dropped(mut self, hook: impl Fn(FlowError) + Send + Sync + 'static) -> Self {
        self.on_error_dropped = Some(Arc::new(hook));
        self
    }

    /// Called with items signalled after termination.
    pub fn on_item_dropped(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_item_dropped = Some(Arc::new(hook));
        self
    }

    /// Called with buffered items discarded on cancellation or error.
    pub fn on_discard(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_discard = Some(Arc::new(hook));
        self
    }

    pub(crate) fn error_dropped(&self, err: FlowError) {
        match &self.on_error_dropped {
            Some(hook) => hook(err),
            None => log::warn!("dropped error after termination: {err}"),
        }
    }

    pub(crate) fn item_dropped(&self, item: T) {
        match &self.on_item_dropped {
            Some(hook) => hook(item),
            None => {
                log::debug!("dropped item signalled after termination");
                drop(item);
            }
        }
    }

    pub(crate) fn discard(&self, item: T) {
        if let Some(hook) = &self.on_discard {
            hook(item);
        }
    }
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Hooks<T> {
    fn clone(&self) -> Self {
        Self {
            on_error_dropped: self.on_error_dropped.clone(),
            on_item_dropped: self.on_item_dropped.clone(),
            on_discard: self.on_discard.clone(),
        }
    }
}
