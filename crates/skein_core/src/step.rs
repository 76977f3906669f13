//! Steps: the callable abstraction the engine resolves arguments for.
//!
//! A [`Step`] declares its default requirements and return policy and is
//! invoked with resolved arguments. Plain functions become steps through
//! [`IntoStep`], with one [`Injectable`] parameter per argument; the adapter
//! is the extraction collaborator, deriving one [`Need`] per parameter from
//! the parameter types. [`ErasedStep`] is the object-safe form stored in
//! pipelines.
//!
//! # Example
//!
//! ```
//! use skein_core::prelude::*;
//!
//! struct Config { url: String }
//!
//! fn connect(config: Res<Config>) -> String {
//!     config.url.clone()
//! }
//!
//! let scope = Scope::new();
//! scope.add(Config { url: "nats://localhost".into() }).unwrap();
//! assert_eq!(scope.call(connect).unwrap(), "nats://localhost");
//! ```

use core::any::TypeId;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use variadics_please::all_tuples;

use crate::declarations::{Requires, Returns};
use crate::error::{Error, Result};
use crate::key::TypeKey;
use crate::requirement::{Need, Resolved};
use crate::resource::ResourceValue;
use crate::scope::Scope;

/// Identity of a step, used to key the declaration cache.
///
/// Function adapters are identified by their function type, so the same
/// function always hits the same cache slot; wrappers that carry their own
/// declarations get a fresh instance identity instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepId {
    /// Identified by a Rust type, typically the function item type.
    Type(TypeId),
    /// A unique per-instance identity.
    Instance(u64),
}

impl StepId {
    /// The identity of the type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self::Type(TypeId::of::<T>())
    }

    /// A fresh identity, distinct from every other.
    #[must_use]
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self::Instance(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A shared handle to a resolved resource, injected into step parameters.
///
/// Dereferences to the resource; the underlying value stays in the scope
/// (or in the resolution that produced it) and is never copied.
pub struct Res<T> {
    inner: Arc<T>,
}

impl<T> Res<T> {
    /// Wraps an already-shared value.
    #[must_use]
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }

    /// Unwraps into the shared allocation.
    #[must_use]
    pub fn into_arc(self) -> Arc<T> {
        self.inner
    }

    /// Clones the resource out of the handle.
    #[must_use]
    pub fn cloned(&self) -> T
    where
        T: Clone,
    {
        (*self.inner).clone()
    }
}

impl<T> Clone for Res<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Deref for Res<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for Res<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// A parameter that can be injected into a step.
///
/// Each implementation supplies the default [`Need`] derived for the
/// parameter and builds itself from the resolution outcome.
pub trait Injectable: Sized + Send + 'static {
    /// The default requirement derived for this parameter.
    fn requirement() -> Need;

    /// Builds the parameter from a resolution outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Inject`] when the resolved value has the wrong type for
    /// this parameter, [`Error::Unsatisfied`] when a mandatory parameter
    /// received an absent resolution.
    fn inject(resolved: Resolved) -> Result<Self>;
}

impl<T: Send + Sync + 'static> Injectable for Res<T> {
    fn requirement() -> Need {
        Need::of::<T>()
    }

    fn inject(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Value(value) => {
                let found = value.type_key();
                value.downcast::<T>().map(Res::from_arc).ok_or(Error::Inject {
                    expected: TypeKey::of::<T>(),
                    found,
                })
            }
            Resolved::Absent => Err(Error::Unsatisfied {
                requirement: Need::of::<T>().to_string(),
            }),
            Resolved::Scope(_) => Err(Error::Inject {
                expected: TypeKey::of::<T>(),
                found: TypeKey::of::<Scope>(),
            }),
        }
    }
}

impl<T: Send + Sync + 'static> Injectable for Option<Res<T>> {
    fn requirement() -> Need {
        Need::of::<T>().optional()
    }

    fn inject(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Absent => Ok(None),
            other => Res::<T>::inject(other).map(Some),
        }
    }
}

impl Injectable for Scope {
    fn requirement() -> Need {
        Need::scope()
    }

    fn inject(resolved: Resolved) -> Result<Self> {
        match resolved {
            Resolved::Scope(scope) => Ok(scope),
            // A custom resolution step may hand back a scope as a value.
            Resolved::Value(value) => {
                let found = value.type_key();
                value
                    .downcast::<Scope>()
                    .map(|scope| (*scope).clone())
                    .ok_or(Error::Inject {
                        expected: TypeKey::of::<Scope>(),
                        found,
                    })
            }
            Resolved::Absent => Err(Error::Unsatisfied {
                requirement: Need::scope().to_string(),
            }),
        }
    }
}

/// The resolved arguments for one invocation, in parameter order.
pub struct Args {
    resolved: VecDeque<Resolved>,
}

impl Args {
    /// Wraps resolved values in parameter order.
    #[must_use]
    pub fn new(resolved: Vec<Resolved>) -> Self {
        Self {
            resolved: resolved.into(),
        }
    }

    /// Remaining argument count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// True when no arguments remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Takes the next argument in parameter order.
    pub fn next(&mut self) -> Option<Resolved> {
        self.resolved.pop_front()
    }
}

/// An executable unit with declared requirements and a return policy.
///
/// Most steps are plain functions converted through [`IntoStep`]; implement
/// `Step` directly when a step needs handwritten requirements or invocation
/// behavior.
pub trait Step: Send + Sync + 'static {
    /// The value produced by this step.
    type Output: Send + Sync + 'static;

    /// Name used in diagnostics and pipeline errors.
    fn name(&self) -> &str;

    /// Identity for the declaration cache.
    fn id(&self) -> StepId;

    /// The requirements derived from this step's parameters.
    fn default_requires(&self) -> Requires;

    /// The return policy used when none is declared or passed explicitly.
    fn default_returns(&self) -> Returns {
        Returns::ResultType
    }

    /// Invokes the step with resolved arguments.
    ///
    /// # Errors
    ///
    /// [`Error::Arity`] or [`Error::Inject`] when the arguments do not fit
    /// the parameters; [`Error::Step`] carrying whatever the step itself
    /// failed with.
    fn invoke(&self, args: Args) -> Result<Self::Output>;
}

/// Object-safe form of [`Step`] with the output type erased, for storage in
/// pipelines and heterogeneous collections.
pub trait ErasedStep: Send + Sync + 'static {
    /// Name used in diagnostics and pipeline errors.
    fn name(&self) -> &str;

    /// Identity for the declaration cache.
    fn id(&self) -> StepId;

    /// The requirements derived from this step's parameters.
    fn default_requires(&self) -> Requires;

    /// The return policy used when none is declared or passed explicitly.
    fn default_returns(&self) -> Returns;

    /// The erased output type.
    fn output_type(&self) -> TypeKey;

    /// Invokes the step, erasing its output.
    ///
    /// # Errors
    ///
    /// As for [`Step::invoke`].
    fn invoke_erased(&self, args: Args) -> Result<ResourceValue>;
}

impl<S: Step> ErasedStep for S {
    fn name(&self) -> &str {
        Step::name(self)
    }

    fn id(&self) -> StepId {
        Step::id(self)
    }

    fn default_requires(&self) -> Requires {
        Step::default_requires(self)
    }

    fn default_returns(&self) -> Returns {
        Step::default_returns(self)
    }

    fn output_type(&self) -> TypeKey {
        TypeKey::of::<S::Output>()
    }

    fn invoke_erased(&self, args: Args) -> Result<ResourceValue> {
        Ok(ResourceValue::new(self.invoke(args)?))
    }
}

/// Converts a value into a [`Step`].
///
/// The `Marker` parameter keeps the implementations for different function
/// shapes coherent; it is always inferred.
pub trait IntoStep<Marker> {
    /// The resulting step type.
    type Step: Step;

    /// Performs the conversion.
    fn into_step(self) -> Self::Step;
}

/// Marker for values that already are steps.
pub struct StepMarker;

impl<S: Step> IntoStep<StepMarker> for S {
    type Step = S;

    fn into_step(self) -> S {
        self
    }
}

/// A step wrapping a plain function.
pub struct FunctionStep<F, Marker> {
    func: F,
    name: &'static str,
    _marker: PhantomData<fn() -> Marker>,
}

/// Marker for infallible function steps.
pub struct FnMarker;

/// A step wrapping a fallible function; built with [`fallible`].
pub struct TryFunctionStep<F, Marker> {
    func: F,
    name: &'static str,
    _marker: PhantomData<fn() -> Marker>,
}

/// Marker for fallible function steps.
pub struct TryFnMarker;

/// Wrapper selecting the fallible conversion for a `Result`-returning
/// function: the `Ok` value becomes the step output and the error is
/// propagated unchanged as [`Error::Step`].
pub struct Fallible<F>(F);

/// Marks a `Result`-returning function as a fallible step.
///
/// Registration-time tagging keeps the dispatch decision auditable; without
/// it, a returned `Result` would be stored as a value like any other.
pub fn fallible<F>(f: F) -> Fallible<F> {
    Fallible(f)
}

// Zero-parameter impls are written out by hand; the macro below generates
// arities 1..=8.

impl<F, R> IntoStep<(FnMarker, R)> for F
where
    F: Fn() -> R + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    type Step = FunctionStep<F, (FnMarker, R)>;

    fn into_step(self) -> Self::Step {
        FunctionStep {
            func: self,
            name: core::any::type_name::<F>(),
            _marker: PhantomData,
        }
    }
}

impl<F, R> Step for FunctionStep<F, (FnMarker, R)>
where
    F: Fn() -> R + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    type Output = R;

    fn name(&self) -> &str {
        self.name
    }

    fn id(&self) -> StepId {
        StepId::of::<F>()
    }

    fn default_requires(&self) -> Requires {
        Requires::none()
    }

    fn invoke(&self, args: Args) -> Result<R> {
        if !args.is_empty() {
            return Err(Error::Arity {
                expected: 0,
                found: args.len(),
            });
        }
        Ok((self.func)())
    }
}

impl<F, R, E> IntoStep<(TryFnMarker, R, E)> for Fallible<F>
where
    F: Fn() -> core::result::Result<R, E> + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
{
    type Step = TryFunctionStep<F, (TryFnMarker, R, E)>;

    fn into_step(self) -> Self::Step {
        TryFunctionStep {
            func: self.0,
            name: core::any::type_name::<F>(),
            _marker: PhantomData,
        }
    }
}

impl<F, R, E> Step for TryFunctionStep<F, (TryFnMarker, R, E)>
where
    F: Fn() -> core::result::Result<R, E> + Send + Sync + 'static,
    R: Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
{
    type Output = R;

    fn name(&self) -> &str {
        self.name
    }

    fn id(&self) -> StepId {
        StepId::of::<F>()
    }

    fn default_requires(&self) -> Requires {
        Requires::none()
    }

    fn invoke(&self, args: Args) -> Result<R> {
        if !args.is_empty() {
            return Err(Error::Arity {
                expected: 0,
                found: args.len(),
            });
        }
        (self.func)().map_err(|e| Error::Step(e.into()))
    }
}

macro_rules! impl_step_for_fn {
    ($($P:ident),*) => {
        impl<F, R, $($P),*> IntoStep<(FnMarker, R, $($P,)*)> for F
        where
            F: Fn($($P),*) -> R + Send + Sync + 'static,
            R: Send + Sync + 'static,
            $($P: Injectable,)*
        {
            type Step = FunctionStep<F, (FnMarker, R, $($P,)*)>;

            fn into_step(self) -> Self::Step {
                FunctionStep {
                    func: self,
                    name: core::any::type_name::<F>(),
                    _marker: PhantomData,
                }
            }
        }

        impl<F, R, $($P),*> Step for FunctionStep<F, (FnMarker, R, $($P,)*)>
        where
            F: Fn($($P),*) -> R + Send + Sync + 'static,
            R: Send + Sync + 'static,
            $($P: Injectable,)*
        {
            type Output = R;

            fn name(&self) -> &str {
                self.name
            }

            fn id(&self) -> StepId {
                StepId::of::<F>()
            }

            fn default_requires(&self) -> Requires {
                Requires::from(vec![$($P::requirement()),*])
            }

            fn invoke(&self, mut args: Args) -> Result<R> {
                let params: &[&str] = &[$(stringify!($P)),*];
                if args.len() != params.len() {
                    return Err(Error::Arity {
                        expected: params.len(),
                        found: args.len(),
                    });
                }
                Ok((self.func)($(
                    $P::inject(args.next().expect("argument count checked"))?
                ),*))
            }
        }

        impl<F, R, E, $($P),*> IntoStep<(TryFnMarker, R, E, $($P,)*)> for Fallible<F>
        where
            F: Fn($($P),*) -> core::result::Result<R, E> + Send + Sync + 'static,
            R: Send + Sync + 'static,
            E: Into<anyhow::Error> + 'static,
            $($P: Injectable,)*
        {
            type Step = TryFunctionStep<F, (TryFnMarker, R, E, $($P,)*)>;

            fn into_step(self) -> Self::Step {
                TryFunctionStep {
                    func: self.0,
                    name: core::any::type_name::<F>(),
                    _marker: PhantomData,
                }
            }
        }

        impl<F, R, E, $($P),*> Step for TryFunctionStep<F, (TryFnMarker, R, E, $($P,)*)>
        where
            F: Fn($($P),*) -> core::result::Result<R, E> + Send + Sync + 'static,
            R: Send + Sync + 'static,
            E: Into<anyhow::Error> + 'static,
            $($P: Injectable,)*
        {
            type Output = R;

            fn name(&self) -> &str {
                self.name
            }

            fn id(&self) -> StepId {
                StepId::of::<F>()
            }

            fn default_requires(&self) -> Requires {
                Requires::from(vec![$($P::requirement()),*])
            }

            fn invoke(&self, mut args: Args) -> Result<R> {
                let params: &[&str] = &[$(stringify!($P)),*];
                if args.len() != params.len() {
                    return Err(Error::Arity {
                        expected: params.len(),
                        found: args.len(),
                    });
                }
                (self.func)($(
                    $P::inject(args.next().expect("argument count checked"))?
                ),*)
                .map_err(|e| Error::Step(e.into()))
            }
        }
    };
}

all_tuples!(impl_step_for_fn, 1, 8, P);

/// A step with declarations attached, replacing the defaults its inner step
/// derives. The analog of decorating a callable with its requirements.
pub struct DeclaredStep<S: Step> {
    inner: S,
    id: StepId,
    name: Option<String>,
    requires: Option<Requires>,
    returns: Option<Returns>,
}

/// Wraps a step so declarations can be attached to it.
///
/// Each wrapper carries its own identity, so attached declarations never
/// pollute the cached declarations of the bare function.
pub fn step<Marker, S: IntoStep<Marker>>(inner: S) -> DeclaredStep<S::Step> {
    DeclaredStep {
        inner: inner.into_step(),
        id: StepId::unique(),
        name: None,
        requires: None,
        returns: None,
    }
}

impl<S: Step> DeclaredStep<S> {
    /// Overrides the step's diagnostic name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares the step's requirements, replacing the derived defaults.
    #[must_use]
    pub fn requires(mut self, requires: Requires) -> Self {
        self.requires = Some(requires);
        self
    }

    /// Declares the step's return policy, replacing the default.
    #[must_use]
    pub fn returns(mut self, returns: Returns) -> Self {
        self.returns = Some(returns);
        self
    }
}

impl<S: Step> Step for DeclaredStep<S> {
    type Output = S::Output;

    fn name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.inner.name(),
        }
    }

    fn id(&self) -> StepId {
        self.id
    }

    fn default_requires(&self) -> Requires {
        self.requires
            .clone()
            .unwrap_or_else(|| self.inner.default_requires())
    }

    fn default_returns(&self) -> Returns {
        self.returns
            .clone()
            .unwrap_or_else(|| self.inner.default_returns())
    }

    fn invoke(&self, args: Args) -> Result<Self::Output> {
        self.inner.invoke(args)
    }
}
