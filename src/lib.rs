//! Lock-free reactive stream flattening
//!
//! `confluo` implements the merging core of a reactive `flat_map`: every
//! upstream element is mapped to an inner asynchronous sequence and all
//! concurrently active inner sequences are merged into a single downstream
//! sequence under demand-based flow control.
//!
//!```text
//!                     ┌────────► inner ──► SPSC ring ─┐
//! upstream ─ mapper ──┼────────► inner ──► SPSC ring ─┼──► drain ──► downstream
//!                     └─ scalar ─────► MPSC ring ─────┘      ▲
//!                                                            │
//!                                         request(n) ────────┘
//!```
//!
//! ## How It Works
//!
//! - Each inner sequence buffers into its own bounded lock-free queue.
//! - A **drain loop** merges the buffers downstream, round robin, emitting
//!   at most as much as the downstream requested.
//! - The drain is serialized by a work-in-progress counter: whichever
//!   thread bumps it from zero runs the loop, everyone else just signals.
//!   No locks on the hot path, no blocking anywhere.
//! - Scalar inner sequences (zero or one synchronously available value)
//!   skip inner allocation entirely and ride a shared queue or go out
//!   inline.
//! - Producers that expose their queues are consumed by **fusion** (SYNC or
//!   ASYNC) instead of per-element signalling.
//!
//! ## Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`flow`] | The publisher/subscriber contract, demand, errors, hooks |
//! | [`flat_map`] | The operator: builder, coordinator, drain loop |
//! | [`source`] | `from_iter`/`range`, `fail`, `pipe`, mapper outputs |
//! | [`probe`] | Introspection of live operator state |
//! | [`stream`] | `futures::Stream` bridge (feature `async`) |
//! | [`testkit`] | Recording subscriber and demand probes |
//!
//! ## Example
//!
//!```
//! use confluo::flat_map::flat_map;
//! use confluo::source::{range, Mapped};
//! use confluo::flow::Publisher;
//! use confluo::testkit::TestSubscriber;
//!
//! // Map every element to a two-element sequence and merge them all.
//! let doubled = flat_map(range(0, 100), |v: &i64| Ok(Mapped::stream(range(*v * 2, 2))));
//!
//! let out = TestSubscriber::unbounded();
//! doubled.subscribe(out.clone());
//!
//! assert_eq!(out.value_count(), 200);
//! assert!(out.is_complete());
//! ```

pub mod flat_map;
pub mod flow;
pub mod probe;
pub mod source;
#[cfg(feature = "async")]
pub mod stream;
pub mod testkit;

mod queue;
mod ring;

pub use flat_map::{FlatMap, flat_map, flat_map_delay_error};
pub use flow::{FlowError, FuseMode, Handle, Hooks, Publisher, Subscriber, Subscription, UNBOUNDED};
pub use source::{Mapped, from_iter, range};
