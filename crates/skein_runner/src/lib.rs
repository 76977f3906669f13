//! Pipelines and the suspending engine for skein (layer 2).
//!
//! This crate builds on `skein_core`'s blocking resolution engine:
//!
//! - [`runner`] - the ordered pipeline ([`Runner`](runner::Runner)) with
//!   first/default/last ordering over one shared scope
//! - [`engine`] - the suspending engine ([`AsyncScope`](engine::AsyncScope))
//!   and async step adapters
//! - [`bridge`] - the blocking bridge ([`SyncBridge`](bridge::SyncBridge))
//!   from non-suspending code into a running scheduler
//!
//! Whether a step or resolver suspends is decided at registration, never by
//! probing at runtime: pipelines take blocking steps through
//! [`Runner::add`](runner::Runner::add) and suspending ones through
//! [`Runner::add_async`](runner::Runner::add_async), and either kind of
//! pipeline runs on the suspending engine with identical ordering and
//! storage effects.

/// The blocking bridge into a running scheduler.
pub mod bridge;

/// The suspending engine and async step adapters.
pub mod engine;

/// The ordered pipeline.
pub mod runner;

/// Re-export of the common surface, including `skein_core`'s.
pub mod prelude {
    pub use crate::bridge::SyncBridge;
    pub use crate::engine::{
        AsyncScope, AsyncStep, ErasedAsyncStep, IntoAsyncStep, fallible_async,
    };
    pub use crate::runner::{EntryMut, Order, Runner};
    pub use skein_core::prelude::*;
}
