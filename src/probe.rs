//! Runtime introspection of operator state.
//!
//! Debugging a merge means asking a live coordinator what it believes:
//! how much demand is outstanding, whether it saw a terminal, how much is
//! buffered. [`Inspect::scan`] answers those questions without touching the
//! hot paths - every attribute maps to a lock-free read.

/// Attributes queryable on the coordinator and on each inner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    /// Whether an upstream is attached.
    Parent,
    /// Whether a downstream is being served.
    Actual,
    /// Demand currently outstanding from the downstream.
    RequestedFromDownstream,
    /// Configured per-inner batch size.
    Prefetch,
    /// Reached a terminal state.
    Terminated,
    /// Downstream cancelled.
    Cancelled,
    /// Pending (not yet delivered) error, rendered as text.
    Error,
    /// Buffered item count, saturating at `u32::MAX`.
    Buffered,
    /// Buffered item count, full width.
    LargeBuffered,
    /// Whether errors are delayed until all sequences finish.
    DelayError,
    /// How the component runs its work loop.
    RunStyle,
}

/// Value of a scanned attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Flag(bool),
    Count(u64),
    Text(String),
}

impl AttrValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            Self::Count(n) => Some(*n),
            _ => None,
        }
    }
}

/// Implemented by components that expose their internals for inspection.
pub trait Inspect {
    /// Reads one attribute. `None` means the attribute does not apply to
    /// this component.
    fn scan(&self, attr: Attr) -> Option<AttrValue>;
}
