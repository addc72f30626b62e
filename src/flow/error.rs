use std::error;
use std::fmt;
use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU8, Ordering},
};

/// Error signalled through a flow's `on_error` channel.
///
/// User errors pass through boxed and unaltered; the operator itself only
/// ever fabricates [`overflow`](Self::overflow) and
/// [`bad_request`](Self::bad_request). Multiple failures racing into one
/// terminal signal are folded into a [`Composite`](Self::Composite).
#[derive(Debug)]
pub enum FlowError {
    /// A value arrived with no free buffer slot and no demand to absorb it.
    Overflow,
    /// A downstream requested a non-positive amount.
    BadRequest,
    /// An error produced by user code (mapper, callable, inner sequence).
    User(Box<dyn error::Error + Send + Sync>),
    /// Several failures folded into a single terminal signal.
    Composite(Vec<FlowError>),
}

impl FlowError {
    pub fn overflow() -> Self {
        Self::Overflow
    }

    pub fn bad_request() -> Self {
        Self::BadRequest
    }

    pub fn user(err: impl error::Error + Send + Sync + 'static) -> Self {
        Self::User(Box::new(err))
    }

    /// Builds a user error from a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::User(Box::new(Message(msg.into())))
    }

    /// True when this error (or any member of a composite) is an overflow.
    pub fn is_overflow(&self) -> bool {
        match self {
            Self::Overflow => true,
            Self::Composite(errs) => errs.iter().any(FlowError::is_overflow),
            _ => false,
        }
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadRequest)
    }

    /// Folds another failure into this one, preserving arrival order.
    pub fn compose(self, other: FlowError) -> FlowError {
        match self {
            Self::Composite(mut errs) => {
                errs.push(other);
                Self::Composite(errs)
            }
            first => Self::Composite(vec![first, other]),
        }
    }
}

/// Plain-text user error, mostly for tests and examples.
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl error::Error for Message {}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => f.write_str("buffer overflow: value arrived with no free slot"),
            Self::BadRequest => f.write_str("non-positive request amount"),
            Self::User(e) => fmt::Display::fmt(e, f),
            Self::Composite(errs) => {
                f.write_str("multiple errors: [")?;
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    fmt::Display::fmt(e, f)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl error::Error for FlowError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::User(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

const EMPTY: u8 = 0;
const SET: u8 = 1;
const TERMINATED: u8 = 2;

/// Terminal error accumulator with terminate-once semantics.
///
/// The drain's hot path only ever reads the atomic state flag; the composite
/// itself is merged under a short lock. Once [`take`](Self::take) flips the
/// slot to its terminal state, every later [`push`](Self::push) is rejected
/// and the caller routes the rejected error to the dropped-error hook.
pub(crate) struct ErrorSlot {
    /// EMPTY -> SET -> TERMINATED. SET and EMPTY may alternate with
    /// composition; TERMINATED is irrevocable.
    state: AtomicU8,
    slot: Mutex<Option<FlowError>>,
}

impl ErrorSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: Mutex::new(None),
        }
    }

    /// Accumulates an error, composing it with any error already held.
    ///
    /// Returns the error back when the slot is already terminated.
    pub(crate) fn push(&self, err: FlowError) -> Result<(), FlowError> {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        // State transitions are linearized by the lock; the atomic is a
        // lock-free view for the drain.
        if self.state.load(Ordering::Relaxed) == TERMINATED {
            return Err(err);
        }
        *guard = Some(match guard.take() {
            Some(existing) => existing.compose(err),
            None => err,
        });
        self.state.store(SET, Ordering::Release);
        Ok(())
    }

    /// Swaps the slot for the terminal sentinel, returning the composed
    /// error if one was pending. Idempotent: later calls return `None`.
    pub(crate) fn take(&self) -> Option<FlowError> {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.store(TERMINATED, Ordering::Release);
        guard.take()
    }

    /// True when an error is pending delivery (lock-free).
    #[inline]
    pub(crate) fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == SET
    }

    /// True once the slot reached its terminal state (lock-free).
    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }

    /// Renders the pending error without consuming it, for introspection.
    pub(crate) fn describe(&self) -> Option<String> {
        let guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(FlowError::to_string)
    }
}
