//! The requirement protocol: how a single step parameter is satisfied.
//!
//! A [`Need`] names a key (type, label, or both), an optional chain of
//! modifier ops applied to the resolved raw value, an optional default, and
//! optionally a custom resolution step that replaces the store lookup
//! entirely. Resolution follows the same protocol everywhere:
//!
//! 1. a custom resolution step, if present, produces the raw value;
//! 2. otherwise the key is looked up in the scope (local, then parents);
//! 3. modifier ops apply left to right, any of them may short-circuit to
//!    missing;
//! 4. missing resolves to the default when one was declared, otherwise the
//!    requirement is unsatisfied.
//!
//! Custom resolution steps are tagged blocking or suspending when the `Need`
//! is built, so engines dispatch on the tag instead of probing at runtime.

use core::fmt;
use core::future::Future;
use std::sync::Arc;

use crate::BoxFuture;
use crate::error::{Error, Result};
use crate::key::{Label, LookupKey, TypeKey};
use crate::resource::{Found, ProviderCtx, ResourceValue};
use crate::scope::Scope;

/// The key a requirement resolves through.
#[derive(Debug, Clone)]
pub enum NeedKey {
    /// Look up by type.
    Type(TypeKey),
    /// Look up by label.
    Label(Label),
    /// Look up by label first, then by type.
    Both {
        /// The type component.
        type_key: TypeKey,
        /// The label component.
        label: Label,
    },
    /// The current scope itself, letting steps receive the scope they are
    /// being resolved against as an argument.
    CurrentScope,
    /// The blocking bridge into a suspending engine. Only satisfiable when a
    /// suspending engine is driving the call.
    Bridge,
    /// No key: resolution is fully delegated to a custom step; the string
    /// names it in diagnostics.
    Custom(String),
}

impl fmt::Display for NeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NeedKey::Type(key) => key.fmt(f),
            NeedKey::Label(label) => label.fmt(f),
            NeedKey::Both { type_key, label } => write!(f, "{type_key} @ {label}"),
            NeedKey::CurrentScope => f.write_str("<scope>"),
            NeedKey::Bridge => f.write_str("<bridge>"),
            NeedKey::Custom(name) => write!(f, "<{name}>"),
        }
    }
}

/// A modifier op: a projection applied to the resolved raw value.
///
/// Returning `None` short-circuits the chain to missing.
#[derive(Clone)]
pub struct Op {
    display: String,
    apply: Arc<dyn Fn(&ResourceValue) -> Option<ResourceValue> + Send + Sync>,
}

impl Op {
    fn new<T, U, F>(display: String, f: F) -> Self
    where
        T: 'static,
        U: Send + Sync + 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        Self {
            display,
            apply: Arc::new(move |value| {
                value.downcast_ref::<T>().and_then(&f).map(ResourceValue::new)
            }),
        }
    }

    fn apply(&self, value: &ResourceValue) -> Option<ResourceValue> {
        (self.apply)(value)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

type BlockingResolveFn = Arc<dyn Fn(Scope) -> Result<Option<ResourceValue>> + Send + Sync>;
type SuspendingResolveFn =
    Arc<dyn Fn(Scope) -> BoxFuture<'static, Result<Option<ResourceValue>>> + Send + Sync>;

/// A custom resolution step attached to a [`Need`], replacing the store
/// lookup. Tagged blocking or suspending at construction.
#[derive(Clone)]
pub struct CustomResolve {
    kind: CustomKind,
}

#[derive(Clone)]
enum CustomKind {
    Blocking(BlockingResolveFn),
    Suspending(SuspendingResolveFn),
}

impl fmt::Debug for CustomResolve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CustomKind::Blocking(_) => f.write_str("<resolve>"),
            CustomKind::Suspending(_) => f.write_str("<suspending resolve>"),
        }
    }
}

impl CustomResolve {
    /// True when this resolution step suspends.
    #[must_use]
    pub fn is_suspending(&self) -> bool {
        matches!(self.kind, CustomKind::Suspending(_))
    }

    /// Runs a blocking resolution step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Suspending`] for a suspending step, or whatever the
    /// step itself returned.
    pub fn resolve_blocking(&self, scope: Scope) -> Result<Option<ResourceValue>> {
        match &self.kind {
            CustomKind::Blocking(f) => f(scope),
            CustomKind::Suspending(_) => Err(Error::Suspending {
                what: "a suspending resolution step".into(),
            }),
        }
    }

    /// Runs the resolution step under a scheduler. Blocking steps resolve
    /// in-place; engines that must not block should check
    /// [`is_suspending`](Self::is_suspending) and run blocking steps on a
    /// worker instead.
    pub fn resolve_suspending(&self, scope: Scope) -> BoxFuture<'static, Result<Option<ResourceValue>>> {
        match &self.kind {
            CustomKind::Blocking(f) => {
                let out = f(scope);
                Box::pin(async move { out })
            }
            CustomKind::Suspending(f) => f(scope),
        }
    }
}

/// The outcome of resolving one requirement.
#[derive(Clone, Debug)]
pub enum Resolved {
    /// A value to inject.
    Value(ResourceValue),
    /// An optional requirement that could not be satisfied and had no
    /// default. Injectable only into parameters that accept absence.
    Absent,
    /// The current scope, for requirements keyed on the scope itself.
    Scope(Scope),
}

/// What an engine must do to obtain a requirement's raw value.
pub enum ResolvePlan<'a> {
    /// Hand over the scope driving the resolution.
    CurrentScope,
    /// Hand over a blocking bridge; only a suspending engine can.
    Bridge,
    /// Run the custom resolution step.
    Custom(&'a CustomResolve),
    /// Look the key up in the store.
    Lookup(LookupKey),
}

/// The requirement for an individual parameter of a step.
#[derive(Clone, Debug)]
pub struct Need {
    key: NeedKey,
    target: Option<String>,
    ops: Vec<Op>,
    default: Option<ResourceValue>,
    optional: bool,
    custom: Option<CustomResolve>,
}

impl Need {
    fn from_key(key: NeedKey) -> Self {
        Self {
            key,
            target: None,
            ops: Vec::new(),
            default: None,
            optional: false,
            custom: None,
        }
    }

    /// A requirement satisfied by the resource of type `T`.
    #[must_use]
    pub fn of<T: Send + Sync + 'static>() -> Self {
        Self::from_key(NeedKey::Type(TypeKey::of::<T>()))
    }

    /// A requirement satisfied by the resource under `label`.
    pub fn label(label: impl Into<Label>) -> Self {
        Self::from_key(NeedKey::Label(label.into()))
    }

    /// A requirement for the current scope itself.
    #[must_use]
    pub fn scope() -> Self {
        Self::from_key(NeedKey::CurrentScope)
    }

    /// A requirement for the blocking bridge into the driving suspending
    /// engine.
    #[must_use]
    pub fn bridge() -> Self {
        Self::from_key(NeedKey::Bridge)
    }

    /// A requirement resolved entirely by `f` instead of a store lookup.
    /// `name` identifies the step in diagnostics.
    pub fn resolve_with<T, F>(name: impl Into<String>, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Scope) -> Result<Option<T>> + Send + Sync + 'static,
    {
        let mut need = Self::from_key(NeedKey::Custom(name.into()));
        need.custom = Some(CustomResolve {
            kind: CustomKind::Blocking(Arc::new(move |scope| {
                Ok(f(scope)?.map(ResourceValue::new))
            })),
        });
        need
    }

    /// A requirement resolved entirely by the suspending `f`.
    pub fn resolve_with_async<T, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let mut need = Self::from_key(NeedKey::Custom(name.into()));
        need.custom = Some(CustomResolve {
            kind: CustomKind::Suspending(Arc::new(move |scope| {
                let fut = f(scope);
                Box::pin(async move { Ok(fut.await?.map(ResourceValue::new)) })
            })),
        });
        need
    }

    /// Adds a label to a type-keyed requirement; the label index is
    /// consulted first when both keys are present.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<Label>) -> Self {
        self.key = match self.key {
            NeedKey::Type(type_key) | NeedKey::Both { type_key, .. } => NeedKey::Both {
                type_key,
                label: label.into(),
            },
            other => other,
        };
        self
    }

    /// Names the parameter this requirement targets. Used to match explicit
    /// overrides onto declared requirements and in diagnostics.
    #[must_use]
    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.target = Some(name.into());
        self
    }

    /// Makes the requirement optional with `default`, yielded silently when
    /// resolution comes up missing.
    #[must_use]
    pub fn or<T: Send + Sync + 'static>(mut self, default: T) -> Self {
        self.default = Some(ResourceValue::new(default));
        self.optional = true;
        self
    }

    /// Makes the requirement optional without a default; a missing value
    /// resolves to [`Resolved::Absent`].
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Appends an attribute-style projection: extract a part of the resolved
    /// `T`. Returning `None` short-circuits the chain to missing.
    #[must_use]
    pub fn attr<T, U, F>(mut self, name: &str, f: F) -> Self
    where
        T: 'static,
        U: Send + Sync + 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        self.ops.push(Op::new(format!(".{name}"), f));
        self
    }

    /// Appends an item-style projection: extract the entry under `key` from
    /// the resolved `T`. Returning `None` short-circuits to missing.
    #[must_use]
    pub fn item<T, U, F>(mut self, key: &str, f: F) -> Self
    where
        T: 'static,
        U: Send + Sync + 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        self.ops.push(Op::new(format!("[{key:?}]"), f));
        self
    }

    /// The key this requirement resolves through.
    #[must_use]
    pub fn key(&self) -> &NeedKey {
        &self.key
    }

    /// The targeted parameter name, if declared.
    #[must_use]
    pub fn target_name(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The declared default, cloned for handing to providers.
    #[must_use]
    pub fn default_value(&self) -> Option<ResourceValue> {
        self.default.clone()
    }

    /// Classifies what an engine must do to obtain the raw value.
    #[must_use]
    pub fn plan(&self) -> ResolvePlan<'_> {
        if let Some(custom) = &self.custom {
            return ResolvePlan::Custom(custom);
        }
        match &self.key {
            NeedKey::CurrentScope => ResolvePlan::CurrentScope,
            NeedKey::Bridge => ResolvePlan::Bridge,
            NeedKey::Type(key) => ResolvePlan::Lookup(LookupKey::by_type(*key)),
            NeedKey::Label(label) => ResolvePlan::Lookup(LookupKey::by_label(label.clone())),
            NeedKey::Both { type_key, label } => {
                ResolvePlan::Lookup(LookupKey::by_both(*type_key, label.clone()))
            }
            // A custom key never matches the store; without its resolution
            // step there is nothing left to look up.
            NeedKey::Custom(_) => ResolvePlan::Lookup(LookupKey::empty()),
        }
    }

    /// Finishes the protocol from a raw lookup result: applies the modifier
    /// chain, then the default or optionality.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsatisfied`] when the value is missing and the
    /// requirement is mandatory.
    pub fn complete(&self, raw: Option<ResourceValue>) -> Result<Resolved> {
        let mut value = raw;
        for op in &self.ops {
            value = match value {
                Some(current) => op.apply(&current),
                None => break,
            };
        }
        match value {
            Some(value) => Ok(Resolved::Value(value)),
            None => {
                if let Some(default) = &self.default {
                    Ok(Resolved::Value(default.clone()))
                } else if self.optional {
                    Ok(Resolved::Absent)
                } else {
                    Err(Error::Unsatisfied {
                        requirement: self.to_string(),
                    })
                }
            }
        }
    }

    /// Resolves this requirement against `scope` on the blocking engine.
    ///
    /// # Errors
    ///
    /// [`Error::Unsatisfied`] for a mandatory miss, [`Error::Suspending`]
    /// when the requirement needs a scheduler, or whatever a custom
    /// resolution step returned.
    pub fn resolve_blocking(&self, scope: &Scope) -> Result<Resolved> {
        match self.plan() {
            ResolvePlan::CurrentScope => Ok(Resolved::Scope(scope.clone())),
            ResolvePlan::Bridge => Err(Error::Suspending {
                what: self.to_string(),
            }),
            ResolvePlan::Custom(custom) => {
                let raw = custom.resolve_blocking(scope.clone())?;
                self.complete(raw)
            }
            ResolvePlan::Lookup(key) => {
                let raw = match scope.find(&key) {
                    Some(Found::Value(value)) => Some(value),
                    Some(Found::Provider(provider)) => provider.invoke_blocking(
                        ProviderCtx::new(scope.clone(), self.default_value()),
                    )?,
                    None => None,
                };
                self.complete(raw)
            }
        }
    }
}

impl fmt::Display for Need {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(target) = &self.target {
            write!(f, "{target}=")?;
        }
        write!(f, "Need({}", self.key)?;
        if self.default.is_some() {
            write!(f, ", default")?;
        } else if self.optional {
            write!(f, ", optional")?;
        }
        write!(f, ")")?;
        for op in &self.ops {
            f.write_str(&op.display)?;
        }
        Ok(())
    }
}
