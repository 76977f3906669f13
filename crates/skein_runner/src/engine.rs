//! The suspending resolution engine.
//!
//! [`AsyncScope`] mirrors the blocking `call`/`extract` on
//! [`Scope`](skein_core::scope::Scope) with suspension points at each
//! requirement resolution and at the final invocation. It owns an explicit
//! [`Handle`] to its scheduler; there is no reliance on ambient global
//! state. Blocking steps, providers, and custom resolution steps dispatched
//! through it run on the runtime's blocking worker pool, so they can never
//! stall the scheduler. Both engines produce identical resolved values and
//! identical storage side effects for the same declarations; only the
//! suspension points differ.

use core::future::Future;
use core::marker::PhantomData;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::trace;

use skein_core::BoxFuture;
use skein_core::declarations::{Requires, Returns};
use skein_core::error::{Error, Result};
use skein_core::key::{Label, TypeKey};
use skein_core::requirement::{Need, Resolved, ResolvePlan};
use skein_core::resource::{Found, ProviderCtx, ResourceValue};
use skein_core::scope::Scope;
use skein_core::step::{Args, ErasedStep, Injectable, IntoStep, Res, Step, StepId};

use crate::bridge::SyncBridge;

/// An executable unit whose invocation suspends.
///
/// The suspending counterpart of [`Step`]; most suspending steps are async
/// functions converted through [`IntoAsyncStep`].
pub trait AsyncStep: Send + Sync + 'static {
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
    fn invoke(&self, args: Args) -> BoxFuture<'_, Result<Self::Output>>;
}

/// Object-safe form of [`AsyncStep`] with the output type erased.
pub trait ErasedAsyncStep: Send + Sync + 'static {
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
    fn invoke_erased(&self, args: Args) -> BoxFuture<'_, Result<ResourceValue>>;
}

impl<S: AsyncStep> ErasedAsyncStep for S {
    fn name(&self) -> &str {
        AsyncStep::name(self)
    }

    fn id(&self) -> StepId {
        AsyncStep::id(self)
    }

    fn default_requires(&self) -> Requires {
        AsyncStep::default_requires(self)
    }

    fn default_returns(&self) -> Returns {
        AsyncStep::default_returns(self)
    }

    fn output_type(&self) -> TypeKey {
        TypeKey::of::<S::Output>()
    }

    fn invoke_erased(&self, args: Args) -> BoxFuture<'_, Result<ResourceValue>> {
        Box::pin(async move { Ok(ResourceValue::new(self.invoke(args).await?)) })
    }
}

/// Converts a value into an [`AsyncStep`].
pub trait IntoAsyncStep<Marker> {
    /// The resulting step type.
    type Step: AsyncStep;

    /// Performs the conversion.
    fn into_async_step(self) -> Self::Step;
}

/// Marker for values that already are suspending steps.
pub struct AsyncStepMarker;

impl<S: AsyncStep> IntoAsyncStep<AsyncStepMarker> for S {
    type Step = S;

    fn into_async_step(self) -> S {
        self
    }
}

/// A suspending step wrapping an async function.
pub struct AsyncFunctionStep<F, Marker> {
    func: F,
    name: &'static str,
    _marker: PhantomData<fn() -> Marker>,
}

/// Marker for infallible async function steps.
pub struct AsyncFnMarker;

/// A suspending step wrapping a fallible async function; built with
/// [`fallible_async`].
pub struct TryAsyncFunctionStep<F, Marker> {
    func: F,
    name: &'static str,
    _marker: PhantomData<fn() -> Marker>,
}

/// Marker for fallible async function steps.
pub struct TryAsyncFnMarker;

/// Wrapper selecting the fallible conversion for a `Result`-returning async
/// function: the `Ok` value becomes the step output and the error is
/// propagated unchanged.
pub struct FallibleAsync<F>(F);

/// Marks a `Result`-returning async function as a fallible suspending step.
pub fn fallible_async<F>(f: F) -> FallibleAsync<F> {
    FallibleAsync(f)
}

impl<F, Fut, R> IntoAsyncStep<(AsyncFnMarker, R)> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + Sync + 'static,
{
    type Step = AsyncFunctionStep<F, (AsyncFnMarker, R)>;

    fn into_async_step(self) -> Self::Step {
        AsyncFunctionStep {
            func: self,
            name: core::any::type_name::<F>(),
            _marker: PhantomData,
        }
    }
}

impl<F, Fut, R> AsyncStep for AsyncFunctionStep<F, (AsyncFnMarker, R)>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
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

    fn invoke(&self, args: Args) -> BoxFuture<'_, Result<R>> {
        if !args.is_empty() {
            let err = Error::Arity {
                expected: 0,
                found: args.len(),
            };
            return Box::pin(async move { Err(err) });
        }
        let fut = (self.func)();
        Box::pin(async move { Ok(fut.await) })
    }
}

impl<F, Fut, R, E> IntoAsyncStep<(TryAsyncFnMarker, R, E)> for FallibleAsync<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
    R: Send + Sync + 'static,
    E: Into<anyhow::Error> + 'static,
{
    type Step = TryAsyncFunctionStep<F, (TryAsyncFnMarker, R, E)>;

    fn into_async_step(self) -> Self::Step {
        TryAsyncFunctionStep {
            func: self.0,
            name: core::any::type_name::<F>(),
            _marker: PhantomData,
        }
    }
}

impl<F, Fut, R, E> AsyncStep for TryAsyncFunctionStep<F, (TryAsyncFnMarker, R, E)>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
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

    fn invoke(&self, args: Args) -> BoxFuture<'_, Result<R>> {
        if !args.is_empty() {
            let err = Error::Arity {
                expected: 0,
                found: args.len(),
            };
            return Box::pin(async move { Err(err) });
        }
        let fut = (self.func)();
        Box::pin(async move { fut.await.map_err(|e| Error::Step(e.into())) })
    }
}

macro_rules! impl_async_step_for_fn {
    ($($P:ident),*) => {
        impl<F, Fut, R, $($P),*> IntoAsyncStep<(AsyncFnMarker, R, $($P,)*)> for F
        where
            F: Fn($($P),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: Send + Sync + 'static,
            $($P: Injectable,)*
        {
            type Step = AsyncFunctionStep<F, (AsyncFnMarker, R, $($P,)*)>;

            fn into_async_step(self) -> Self::Step {
                AsyncFunctionStep {
                    func: self,
                    name: core::any::type_name::<F>(),
                    _marker: PhantomData,
                }
            }
        }

        impl<F, Fut, R, $($P),*> AsyncStep for AsyncFunctionStep<F, (AsyncFnMarker, R, $($P,)*)>
        where
            F: Fn($($P),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
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

            fn invoke(&self, mut args: Args) -> BoxFuture<'_, Result<R>> {
                let params: &[&str] = &[$(stringify!($P)),*];
                if args.len() != params.len() {
                    let err = Error::Arity {
                        expected: params.len(),
                        found: args.len(),
                    };
                    return Box::pin(async move { Err(err) });
                }
                let started: Result<Fut> = (|| {
                    Ok((self.func)($(
                        $P::inject(args.next().expect("argument count checked"))?
                    ),*))
                })();
                Box::pin(async move {
                    match started {
                        Ok(fut) => Ok(fut.await),
                        Err(err) => Err(err),
                    }
                })
            }
        }

        impl<F, Fut, R, E, $($P),*> IntoAsyncStep<(TryAsyncFnMarker, R, E, $($P,)*)> for FallibleAsync<F>
        where
            F: Fn($($P),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
            R: Send + Sync + 'static,
            E: Into<anyhow::Error> + 'static,
            $($P: Injectable,)*
        {
            type Step = TryAsyncFunctionStep<F, (TryAsyncFnMarker, R, E, $($P,)*)>;

            fn into_async_step(self) -> Self::Step {
                TryAsyncFunctionStep {
                    func: self.0,
                    name: core::any::type_name::<F>(),
                    _marker: PhantomData,
                }
            }
        }

        impl<F, Fut, R, E, $($P),*> AsyncStep for TryAsyncFunctionStep<F, (TryAsyncFnMarker, R, E, $($P,)*)>
        where
            F: Fn($($P),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = core::result::Result<R, E>> + Send + 'static,
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

            fn invoke(&self, mut args: Args) -> BoxFuture<'_, Result<R>> {
                let params: &[&str] = &[$(stringify!($P)),*];
                if args.len() != params.len() {
                    let err = Error::Arity {
                        expected: params.len(),
                        found: args.len(),
                    };
                    return Box::pin(async move { Err(err) });
                }
                let started: Result<Fut> = (|| {
                    Ok((self.func)($(
                        $P::inject(args.next().expect("argument count checked"))?
                    ),*))
                })();
                Box::pin(async move {
                    match started {
                        Ok(fut) => fut.await.map_err(|e| Error::Step(e.into())),
                        Err(err) => Err(err),
                    }
                })
            }
        }
    };
}

variadics_please::all_tuples!(impl_async_step_for_fn, 1, 8, P);

/// The suspending engine: a scope plus an explicitly owned scheduler handle.
#[derive(Clone)]
pub struct AsyncScope {
    scope: Scope,
    handle: Handle,
}

impl AsyncScope {
    /// Creates a suspending engine over `scope`, driven by `handle`.
    #[must_use]
    pub fn new(scope: Scope, handle: Handle) -> Self {
        Self { scope, handle }
    }

    /// The underlying scope. Registration and removal are plain store
    /// operations; use them directly through this.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The scheduler handle driving this engine.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A blocking bridge over this engine's scope and scheduler.
    #[must_use]
    pub fn bridge(&self) -> SyncBridge {
        SyncBridge::new(self.scope.clone(), self.handle.clone())
    }

    /// A suspending engine over a nested child scope.
    #[must_use]
    pub fn nest(&self) -> AsyncScope {
        Self {
            scope: self.scope.nest(),
            handle: self.handle.clone(),
        }
    }

    /// Resolves one requirement, suspending as needed. Blocking providers
    /// and blocking custom resolution steps run on the worker pool.
    ///
    /// # Errors
    ///
    /// As for [`Need::resolve_blocking`], except that suspending facilities
    /// are driven rather than rejected.
    pub async fn resolve(&self, need: &Need) -> Result<Resolved> {
        trace!(requirement = %need, "resolving");
        match need.plan() {
            ResolvePlan::CurrentScope => Ok(Resolved::Scope(self.scope.clone())),
            ResolvePlan::Bridge => Ok(Resolved::Value(ResourceValue::new(self.bridge()))),
            ResolvePlan::Custom(custom) => {
                let raw = if custom.is_suspending() {
                    custom.resolve_suspending(self.scope.clone()).await?
                } else {
                    let custom = custom.clone();
                    let scope = self.scope.clone();
                    self.handle
                        .spawn_blocking(move || custom.resolve_blocking(scope))
                        .await
                        .map_err(join_error)??
                };
                need.complete(raw)
            }
            ResolvePlan::Lookup(key) => {
                let raw = match self.scope.find(&key) {
                    Some(Found::Value(value)) => Some(value),
                    Some(Found::Provider(provider)) => {
                        let ctx = ProviderCtx::new(self.scope.clone(), need.default_value());
                        if provider.is_suspending() {
                            provider.invoke_suspending(ctx).await
                        } else {
                            self.handle
                                .spawn_blocking(move || provider.invoke_blocking(ctx))
                                .await
                                .map_err(join_error)??
                        }
                    }
                    None => None,
                };
                need.complete(raw)
            }
        }
    }

    async fn resolve_args(&self, requires: &Requires) -> Result<Args> {
        let mut resolved = Vec::with_capacity(requires.len());
        for need in requires.iter() {
            resolved.push(self.resolve(need).await?);
        }
        Ok(Args::new(resolved))
    }

    fn effective_async(
        &self,
        step: &dyn ErasedAsyncStep,
        requires: Option<&Requires>,
        returns: Option<&Returns>,
    ) -> (Requires, Returns) {
        if let Some(explicit) = requires {
            let returns = returns.cloned().unwrap_or_else(|| step.default_returns());
            return (explicit.clone(), returns);
        }
        let (cached_requires, cached_returns) = self
            .scope
            .cached_declarations_for(step.id(), || {
                (step.default_requires(), step.default_returns())
            });
        (
            self.scope.apply_requirement_policy(cached_requires),
            returns.cloned().unwrap_or(cached_returns),
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Suspending steps
    // ─────────────────────────────────────────────────────────────────────

    /// Resolves the step's requirements and invokes it, suspending at each
    /// resolution and at the invocation.
    ///
    /// # Errors
    ///
    /// As for [`Scope::call`].
    pub async fn call<Marker, S>(&self, step: S) -> Result<<S::Step as AsyncStep>::Output>
    where
        S: IntoAsyncStep<Marker>,
    {
        let step = step.into_async_step();
        let (requires, _) = self.effective_async(&step, None, None);
        let args = self.resolve_args(&requires).await?;
        step.invoke(args).await
    }

    /// Like [`call`](Self::call), with explicit requirements replacing the
    /// declared ones. Explicit requirements are never cached.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub async fn call_with<Marker, S>(
        &self,
        step: S,
        requires: Requires,
    ) -> Result<<S::Step as AsyncStep>::Output>
    where
        S: IntoAsyncStep<Marker>,
    {
        let step = step.into_async_step();
        let args = self.resolve_args(&requires).await?;
        step.invoke(args).await
    }

    /// Calls the step, then stores its return value into the scope per the
    /// effective return policy, identically to the blocking engine.
    ///
    /// # Errors
    ///
    /// As for [`Scope::extract`].
    pub async fn extract<Marker, S>(&self, step: S) -> Result<Res<<S::Step as AsyncStep>::Output>>
    where
        S: IntoAsyncStep<Marker>,
    {
        self.extract_with(step, None, None).await
    }

    /// Like [`extract`](Self::extract), with explicit declarations.
    ///
    /// # Errors
    ///
    /// As for [`extract`](Self::extract).
    pub async fn extract_with<Marker, S>(
        &self,
        step: S,
        requires: Option<Requires>,
        returns: Option<Returns>,
    ) -> Result<Res<<S::Step as AsyncStep>::Output>>
    where
        S: IntoAsyncStep<Marker>,
    {
        let step = step.into_async_step();
        let (requires, returns) = self.effective_async(&step, requires.as_ref(), returns.as_ref());
        let args = self.resolve_args(&requires).await?;
        let output = Arc::new(step.invoke(args).await?);
        let value = ResourceValue::from_arc(Arc::clone(&output));
        self.scope.store_returned(&returns, &value)?;
        Ok(Res::from_arc(output))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Blocking steps, dispatched onto the worker pool
    // ─────────────────────────────────────────────────────────────────────

    /// Calls a blocking step on the worker pool, suspending until it
    /// completes.
    ///
    /// # Errors
    ///
    /// As for [`Scope::call`].
    pub async fn call_blocking<Marker, S>(&self, step: S) -> Result<<S::Step as Step>::Output>
    where
        S: IntoStep<Marker>,
    {
        let step = step.into_step();
        let (requires, _) = self.scope.effective_declarations(&step, None, None);
        let args = self.resolve_args(&requires).await?;
        self.handle
            .spawn_blocking(move || step.invoke(args))
            .await
            .map_err(join_error)?
    }

    /// Extracts a blocking step on the worker pool: invocation runs on a
    /// worker, storage applies once it completes.
    ///
    /// # Errors
    ///
    /// As for [`Scope::extract`].
    pub async fn extract_blocking<Marker, S>(
        &self,
        step: S,
        requires: Option<Requires>,
        returns: Option<Returns>,
    ) -> Result<Res<<S::Step as Step>::Output>>
    where
        S: IntoStep<Marker>,
    {
        let step = step.into_step();
        let (requires, returns) =
            self.scope
                .effective_declarations(&step, requires.as_ref(), returns.as_ref());
        let args = self.resolve_args(&requires).await?;
        let output = self
            .handle
            .spawn_blocking(move || step.invoke(args))
            .await
            .map_err(join_error)??;
        let output = Arc::new(output);
        let value = ResourceValue::from_arc(Arc::clone(&output));
        self.scope.store_returned(&returns, &value)?;
        Ok(Res::from_arc(output))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Erased paths, for the pipeline
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) async fn extract_erased_async(
        &self,
        step: &dyn ErasedAsyncStep,
        requires: Option<&Requires>,
        returns: Option<&Returns>,
    ) -> Result<ResourceValue> {
        let (requires, returns) = self.effective_async(step, requires, returns);
        let args = self.resolve_args(&requires).await?;
        let value = step.invoke_erased(args).await?;
        self.scope.store_returned(&returns, &value)?;
        Ok(value)
    }

    pub(crate) async fn extract_erased_blocking(
        &self,
        step: Arc<dyn ErasedStep>,
        requires: Option<&Requires>,
        returns: Option<&Returns>,
    ) -> Result<ResourceValue> {
        let (requires, returns) =
            self.scope
                .effective_declarations(&*step, requires, returns);
        let args = self.resolve_args(&requires).await?;
        let value = self
            .handle
            .spawn_blocking(move || step.invoke_erased(args))
            .await
            .map_err(join_error)??;
        self.scope.store_returned(&returns, &value)?;
        Ok(value)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────

    /// Returns the resource of type `T`, driving suspending providers.
    /// Missing keys are `None`, never an error.
    pub async fn get<T: Send + Sync + 'static>(&self) -> Option<Res<T>> {
        self.lookup(Need::of::<T>().optional()).await
    }

    /// Returns the resource under `label`, downcast to `T`.
    pub async fn get_labelled<T: Send + Sync + 'static>(
        &self,
        label: impl Into<Label>,
    ) -> Option<Res<T>> {
        self.lookup(Need::label(label).optional()).await
    }

    async fn lookup<T: Send + Sync + 'static>(&self, need: Need) -> Option<Res<T>> {
        match self.resolve(&need).await {
            Ok(Resolved::Value(value)) => value.downcast::<T>().map(Res::from_arc),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, "lookup failed; treating the key as missing");
                None
            }
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Step(anyhow::Error::new(err))
}
