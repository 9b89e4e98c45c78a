//! Controller half of a cross-process tracer for dynamic-language runtimes.
//!
//! A target process, instrumented with a tracing agent, exposes a pair of
//! SysV message queues keyed on its pid. This crate attaches to that pair,
//! sends commands that install or remove tracers inside the target, and
//! folds the resulting stream of call, return, slow-call, garbage-collection,
//! and expression events into a nested, timestamped call tree on an output
//! sink.
//!
//! The queues have no notification primitive, so every command is followed
//! by a `SIGURG` doorbell, and blocking receives must be resilient to the
//! spurious `EINTR` wakeups any delivered signal causes. [`Session`] owns
//! that loop end to end: the attach handshake, command dispatch, the
//! two-phase drain that keeps the in-kernel queue from saturating during
//! bursts, and the detach that never leaves the target bound.

pub mod error;
pub mod event;
pub mod queue;
pub mod render;
pub mod selector;
pub mod session;
pub mod wire;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use event::Event;

#[doc(inline)]
pub use render::{DisplayOptions, Trace};

#[doc(inline)]
pub use selector::Selector;

#[doc(inline)]
pub use session::Session;
