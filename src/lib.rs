//! A typed resource-resolution engine for Rust.
//!
//! skein wires callables to the values they need at call time: a scoped,
//! dual-indexed resource store, a requirement-satisfaction protocol with
//! modifier ops and custom resolution steps, ordered pipelines with
//! first/default/last scheduling, and twin blocking/suspending execution
//! engines joined by an explicit bridge.
//!
//! # Example
//!
//! ```
//! use skein::prelude::*;
//!
//! struct Config { jobs: usize }
//!
//! fn parse() -> Config {
//!     Config { jobs: 4 }
//! }
//!
//! fn work(config: Res<Config>) -> usize {
//!     config.jobs * 10
//! }
//!
//! let mut runner = Runner::new();
//! runner.add(work);
//! runner.add(parse).first();
//!
//! let scope = runner.run().unwrap();
//! assert_eq!(*scope.get::<usize>().unwrap(), 40);
//! ```

/// Layer 1: the resource store and resolution engine.
pub use skein_core;

/// Layer 2: ordered pipelines, the suspending engine, and the bridge.
pub use skein_runner;

/// Re-export of the common surface from both layers.
pub mod prelude {
    pub use skein_runner::prelude::*;
}
