//! The resolution engine for skein (layer 1).
//!
//! `skein_core` provides the primitives for call-time dependency wiring:
//!
//! - [`scope`] - scoped, dual-indexed resource storage
//! - [`requirement`] - the requirement-satisfaction protocol
//! - [`declarations`] - requirements lists, return policies, and their cache
//! - [`step`] - the callable abstraction and function adapters
//! - [`resource`] - erased values and lazily-invoked providers
//! - [`error`] - the error taxonomy
//!
//! The blocking engine lives on [`Scope`](scope::Scope) as `call` and
//! `extract`; the ordered pipeline and the suspending engine build on top of
//! this crate in `skein_runner` (layer 2).
//!
//! # Example
//!
//! ```
//! use skein_core::prelude::*;
//!
//! struct Config { greeting: String }
//!
//! fn greet(config: Res<Config>) -> String {
//!     format!("{}, world", config.greeting)
//! }
//!
//! let scope = Scope::new();
//! scope.add(Config { greeting: "hello".into() }).unwrap();
//!
//! // `extract` stores the result back into the scope by its type.
//! let out = scope.extract(greet).unwrap();
//! assert_eq!(*out, "hello, world");
//! assert_eq!(*scope.get::<String>().unwrap(), "hello, world");
//! ```

use core::future::Future;
use core::pin::Pin;

/// A boxed future that is `Send`, used at every suspension seam.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error taxonomy.
pub mod error;

/// Resource keys: type keys, labels, and lookup forms.
pub mod key;

/// Erased values and lazily-invoked providers.
pub mod resource;

/// The requirement-satisfaction protocol.
pub mod requirement;

/// Declared requirements, return policies, and the declaration cache.
pub mod declarations;

/// Scoped resource storage.
pub mod scope;

/// The callable abstraction and function adapters.
pub mod step;

/// The blocking call/extract engine on `Scope`.
mod call;

/// Builds a [`Requires`](declarations::Requires) from a list of
/// [`Need`](requirement::Need)s.
///
/// ```
/// use skein_core::prelude::*;
///
/// let requires = requires![Need::of::<String>(), Need::label("port")];
/// assert_eq!(requires.len(), 2);
/// ```
#[macro_export]
macro_rules! requires {
    ($($need:expr),* $(,)?) => {
        $crate::declarations::Requires::from(vec![$($need),*])
    };
}

/// Re-export of the common surface.
pub mod prelude {
    pub use crate::declarations::{Batch, Requires, ResourceMap, Returns};
    pub use crate::error::{Error, Result};
    pub use crate::key::{Label, LookupKey, ResourceKey, TypeKey};
    pub use crate::requirement::{Need, NeedKey, Resolved};
    pub use crate::requires;
    pub use crate::resource::{Provider, ProviderCtx, ResourceValue};
    pub use crate::scope::{RequirementPolicy, Scope};
    pub use crate::step::{
        Args, DeclaredStep, ErasedStep, Injectable, IntoStep, Res, Step, StepId, fallible, step,
    };
}
