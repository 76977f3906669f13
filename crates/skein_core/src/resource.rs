//! Stored resources: erased values and lazily-invoked providers.
//!
//! Values live in the store type-erased, behind an `Arc`, with their
//! [`TypeKey`] captured at insertion so diagnostics and result-type storage
//! keep working after erasure. A store entry is either a concrete value or a
//! provider invoked on every lookup; the store never memoizes provider
//! results.

use core::any::Any;
use core::fmt;
use core::future::Future;
use std::sync::Arc;

use crate::BoxFuture;
use crate::error::{Error, Result};
use crate::key::{Label, TypeKey};
use crate::scope::Scope;

/// A type-erased resource value with its runtime type captured.
#[derive(Clone)]
pub struct ResourceValue {
    key: TypeKey,
    value: Arc<dyn Any + Send + Sync>,
}

impl ResourceValue {
    /// Erases `value`, capturing its type key.
    #[must_use]
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            value: Arc::new(value),
        }
    }

    /// Erases an already-shared value without another allocation.
    #[must_use]
    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            value,
        }
    }

    /// The runtime type key captured at construction.
    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    /// True when the contained value is a `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.key.id() == core::any::TypeId::of::<T>()
    }

    /// Recovers a shared, typed handle to the value.
    #[must_use]
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Borrows the value as a `T`.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.key)
    }
}

/// Arguments handed to a provider on each lookup: the scope the lookup was
/// made against and the caller's default, if one was declared.
pub struct ProviderCtx {
    scope: Scope,
    default: Option<ResourceValue>,
}

impl ProviderCtx {
    /// Builds a context from the scope the lookup was made against and the
    /// caller's default, if one was declared.
    pub fn new(scope: Scope, default: Option<ResourceValue>) -> Self {
        Self { scope, default }
    }

    /// The scope the lookup was made against. Providers may call back into
    /// it, e.g. to read other resources.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The caller's default, when the requirement being resolved carried one.
    #[must_use]
    pub fn default<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.default.as_ref().and_then(ResourceValue::downcast)
    }
}

type BlockingProviderFn = Arc<dyn Fn(ProviderCtx) -> Option<ResourceValue> + Send + Sync>;
type SuspendingProviderFn =
    Arc<dyn Fn(ProviderCtx) -> BoxFuture<'static, Option<ResourceValue>> + Send + Sync>;

/// A lazily-invoked provider registered in place of a concrete value.
///
/// Tagged blocking or suspending at registration; engines inspect the tag
/// and dispatch accordingly rather than probing at runtime.
#[derive(Clone)]
pub struct Provider {
    kind: ProviderKind,
}

#[derive(Clone)]
enum ProviderKind {
    Blocking(BlockingProviderFn),
    Suspending(SuspendingProviderFn),
}

impl Provider {
    pub(crate) fn blocking<T, F>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ProviderCtx) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            kind: ProviderKind::Blocking(Arc::new(move |ctx| f(ctx).map(ResourceValue::new))),
        }
    }

    pub(crate) fn suspending<T, F, Fut>(f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ProviderCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        Self {
            kind: ProviderKind::Suspending(Arc::new(move |ctx| {
                let fut = f(ctx);
                Box::pin(async move { fut.await.map(ResourceValue::new) })
            })),
        }
    }

    /// True when invoking this provider suspends.
    #[must_use]
    pub fn is_suspending(&self) -> bool {
        matches!(self.kind, ProviderKind::Suspending(_))
    }

    /// Invokes a blocking provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Suspending`] for a suspending provider; the caller
    /// has no scheduler to drive it.
    pub fn invoke_blocking(&self, ctx: ProviderCtx) -> Result<Option<ResourceValue>> {
        match &self.kind {
            ProviderKind::Blocking(f) => Ok(f(ctx)),
            ProviderKind::Suspending(_) => Err(Error::Suspending {
                what: "a suspending provider".into(),
            }),
        }
    }

    /// Invokes a suspending provider. Blocking providers resolve immediately
    /// in-place; engines that must not block should check
    /// [`is_suspending`](Self::is_suspending) first and dispatch blocking
    /// providers onto a worker.
    pub fn invoke_suspending(&self, ctx: ProviderCtx) -> BoxFuture<'static, Option<ResourceValue>> {
        match &self.kind {
            ProviderKind::Blocking(f) => {
                let value = f(ctx);
                Box::pin(async move { value })
            }
            ProviderKind::Suspending(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ProviderKind::Blocking(_) => f.write_str("<provider>"),
            ProviderKind::Suspending(_) => f.write_str("<suspending provider>"),
        }
    }
}

/// What a store entry holds: the provenance of the resource.
#[derive(Clone, Debug)]
pub(crate) enum Stored {
    /// A concrete value registered directly.
    Value(ResourceValue),
    /// A provider invoked on every lookup.
    Provider(Provider),
}

/// One store entry together with the keys it is indexed under.
#[derive(Clone, Debug)]
pub(crate) struct ResourceEntry {
    pub(crate) stored: Stored,
    pub(crate) type_key: Option<TypeKey>,
    pub(crate) label: Option<Label>,
}

/// Result of locating an entry without invoking providers, used by engines
/// to decide how to dispatch the final resolution step.
#[derive(Clone, Debug)]
pub enum Found {
    /// A concrete value.
    Value(ResourceValue),
    /// A provider still to be invoked.
    Provider(Provider),
}
