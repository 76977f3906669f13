//! The blocking resolution engine: `call` and `extract` on [`Scope`].
//!
//! `call` determines the step's effective requirements, resolves each one
//! against the scope, and invokes the step with the assembled arguments.
//! `extract` additionally redistributes the return value into the scope per
//! the effective return policy, through the same clash-checked registration
//! path used by `add`. Errors raised by the step itself propagate unchanged;
//! the engine never swallows callee failures.
//!
//! Effective declarations come from, in priority order: the explicit
//! per-call argument, the scope's declaration cache, or the defaults derived
//! by the step adapter (which populate the cache as a side effect). Explicit
//! per-call requirements bypass the cache entirely.

use std::sync::Arc;

use tracing::trace;

use crate::declarations::{CachedDecl, Requires, Returns};
use crate::error::Result;
use crate::requirement::Need;
use crate::resource::{ResourceValue, Stored};
use crate::scope::Scope;
use crate::step::{Args, ErasedStep, IntoStep, Res, Step, StepId};

impl Scope {
    /// Resolves the step's requirements and invokes it, returning its raw
    /// output.
    ///
    /// # Errors
    ///
    /// [`Error::Unsatisfied`](crate::error::Error::Unsatisfied) when a
    /// mandatory requirement cannot be met, or whatever the step itself
    /// failed with.
    pub fn call<Marker, S>(&self, step: S) -> Result<<S::Step as Step>::Output>
    where
        S: IntoStep<Marker>,
    {
        let step = step.into_step();
        let (requires, _) = self.effective_declarations(&step, None, None);
        let args = self.resolve_args(&requires)?;
        step.invoke(args)
    }

    /// Like [`call`](Self::call), with explicit requirements replacing the
    /// step's declared ones. Explicit requirements are never cached.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub fn call_with<Marker, S>(&self, step: S, requires: Requires) -> Result<<S::Step as Step>::Output>
    where
        S: IntoStep<Marker>,
    {
        let step = step.into_step();
        let args = self.resolve_args(&requires)?;
        step.invoke(args)
    }

    /// Calls the step, then stores its return value into this scope per the
    /// step's return policy. Returns a shared handle to the same value that
    /// was stored; storage is a side effect, not a transformation.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call), plus
    /// [`Error::Clash`](crate::error::Error::Clash) when a returned value
    /// lands on an occupied key.
    pub fn extract<Marker, S>(&self, step: S) -> Result<Res<<S::Step as Step>::Output>>
    where
        S: IntoStep<Marker>,
    {
        self.extract_with(step, None, None)
    }

    /// Like [`extract`](Self::extract), with explicit requirements and/or
    /// return policy replacing the step's declared ones.
    ///
    /// # Errors
    ///
    /// As for [`extract`](Self::extract).
    pub fn extract_with<Marker, S>(
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
            self.effective_declarations(&step, requires.as_ref(), returns.as_ref());
        let args = self.resolve_args(&requires)?;
        let output = Arc::new(step.invoke(args)?);
        let value = ResourceValue::from_arc(Arc::clone(&output));
        self.store_returned(&returns, &value)?;
        Ok(Res::from_arc(output))
    }

    /// Type-erased [`call`](Self::call), for pipeline engines holding
    /// `dyn ErasedStep`.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call).
    pub fn call_erased(
        &self,
        step: &dyn ErasedStep,
        requires: Option<&Requires>,
    ) -> Result<ResourceValue> {
        let (requires, _) = self.effective_declarations(step, requires, None);
        let args = self.resolve_args(&requires)?;
        step.invoke_erased(args)
    }

    /// Type-erased [`extract`](Self::extract), for pipeline engines holding
    /// `dyn ErasedStep`.
    ///
    /// # Errors
    ///
    /// As for [`extract`](Self::extract).
    pub fn extract_erased(
        &self,
        step: &dyn ErasedStep,
        requires: Option<&Requires>,
        returns: Option<&Returns>,
    ) -> Result<ResourceValue> {
        let (requires, returns) = self.effective_declarations(step, requires, returns);
        let args = self.resolve_args(&requires)?;
        let value = step.invoke_erased(args)?;
        self.store_returned(&returns, &value)?;
        Ok(value)
    }

    /// Stores a step's return value into this scope under `returns`,
    /// through the clash-checked registration path.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`](crate::error::Error::Clash) when a derived key is
    /// already occupied, or a return-shape error when the policy does not
    /// fit the value.
    pub fn store_returned(&self, returns: &Returns, value: &ResourceValue) -> Result<()> {
        for pair in returns.pairs(value)? {
            self.insert_entry(Stored::Value(pair.value), pair.type_key, pair.label)?;
        }
        Ok(())
    }

    /// The effective declarations for one invocation of `step`: explicit
    /// arguments win, then cached declarations, then the adapter-derived
    /// defaults (cached as a side effect). The scope's requirement policy
    /// applies to derived requirements only, never to explicit ones.
    #[must_use]
    pub fn effective_declarations(
        &self,
        step: &dyn ErasedStep,
        requires: Option<&Requires>,
        returns: Option<&Returns>,
    ) -> (Requires, Returns) {
        if let Some(explicit) = requires {
            let returns = returns
                .cloned()
                .unwrap_or_else(|| step.default_returns());
            return (explicit.clone(), returns);
        }
        let cached = self.cached_declarations(step);
        (
            self.apply_requirement_policy(cached.requires),
            returns.cloned().unwrap_or(cached.returns),
        )
    }

    /// The cached declarations for the step identified by `id`, deriving and
    /// caching them on a miss. Exposed for engines that hold steps the
    /// erased blocking trait cannot describe.
    pub fn cached_declarations_for(
        &self,
        id: StepId,
        derive: impl FnOnce() -> (Requires, Returns),
    ) -> (Requires, Returns) {
        if let Some(hit) = self.declarations().read().get(id) {
            return (hit.requires, hit.returns);
        }
        let (requires, returns) = derive();
        self.declarations().write().insert(
            id,
            CachedDecl {
                requires: requires.clone(),
                returns: returns.clone(),
            },
        );
        (requires, returns)
    }

    /// Applies this scope's requirement policy, if any, to derived
    /// requirements.
    #[must_use]
    pub fn apply_requirement_policy(&self, requires: Requires) -> Requires {
        match self.policy() {
            Some(policy) => {
                let policy = Arc::clone(policy);
                requires.map(move |need| policy(need))
            }
            None => requires,
        }
    }

    pub(crate) fn resolve_args(&self, requires: &Requires) -> Result<Args> {
        let mut resolved = Vec::with_capacity(requires.len());
        for need in requires.iter() {
            trace!(requirement = %need, "resolving");
            resolved.push(need.resolve_blocking(self)?);
        }
        Ok(Args::new(resolved))
    }

    fn cached_declarations(&self, step: &dyn ErasedStep) -> CachedDecl {
        if let Some(hit) = self.declarations().read().get(step.id()) {
            return hit;
        }
        let decl = CachedDecl {
            requires: step.default_requires(),
            returns: step.default_returns(),
        };
        self.declarations()
            .write()
            .insert(step.id(), decl.clone());
        decl
    }
}

/// Shorthand for resolving a single requirement against a scope, outside of
/// any step invocation.
impl Scope {
    /// Resolves one requirement against this scope on the blocking engine.
    ///
    /// # Errors
    ///
    /// As for [`Need::resolve_blocking`].
    pub fn resolve(&self, need: &Need) -> Result<crate::requirement::Resolved> {
        need.resolve_blocking(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarations::{Batch, ResourceMap};
    use crate::error::Error;
    use crate::key::ResourceKey;
    use crate::requirement::NeedKey;
    use crate::step::fallible;

    #[derive(Debug, PartialEq, Clone)]
    struct T1(i32);
    #[derive(Debug, PartialEq, Clone)]
    struct T2(i32);

    #[test]
    fn call_with_no_requirements() {
        fn produce() -> &'static str {
            "bar"
        }

        let scope = Scope::new();
        assert_eq!(scope.call(produce).unwrap(), "bar");
    }

    #[test]
    fn call_infers_requirement_from_parameter_type() {
        fn read(value: Res<String>) -> String {
            value.cloned()
        }

        let scope = Scope::new();
        scope.add(String::from("bar")).unwrap();
        assert_eq!(scope.call(read).unwrap(), "bar");
    }

    #[test]
    fn call_by_label_through_explicit_requirements() {
        fn read(x: Res<i32>) -> i32 {
            *x
        }

        let scope = Scope::new();
        scope.add_label_only("x", 1_i32).unwrap();
        let out = scope
            .call_with(read, Requires::none().with(Need::label("x")))
            .unwrap();
        assert_eq!(out, 1);
    }

    #[test]
    fn explicit_requirements_do_not_pollute_later_calls() {
        fn read(value: Res<String>) -> String {
            value.cloned()
        }

        let scope = Scope::new();
        scope.add(String::from("typed")).unwrap();
        scope
            .add_label_only("x", String::from("labelled"))
            .unwrap();

        let via_label = scope
            .call_with(read, Requires::none().with(Need::label("x")))
            .unwrap();
        assert_eq!(via_label, "labelled");

        // The explicit override must not have been cached for the function.
        assert_eq!(scope.call(read).unwrap(), "typed");
    }

    #[test]
    fn missing_mandatory_requirement_names_the_type() {
        fn read(value: Res<T1>) -> i32 {
            value.0
        }

        let scope = Scope::new();
        let err = scope.call(read).unwrap_err();
        assert_eq!(err.to_string(), "Need(T1) could not be satisfied");
    }

    #[test]
    fn optional_parameter_resolves_to_none_when_missing() {
        fn read(value: Option<Res<T1>>) -> i32 {
            value.map(|v| v.0).unwrap_or(-1)
        }

        let scope = Scope::new();
        assert_eq!(scope.call(read).unwrap(), -1);

        scope.add(T1(5)).unwrap();
        assert_eq!(scope.call(read).unwrap(), 5);
    }

    #[test]
    fn steps_can_require_the_scope_itself() {
        fn record(scope: Scope) {
            scope.add(T1(1)).unwrap();
        }

        let scope = Scope::new();
        scope.call(record).unwrap();
        assert_eq!(scope.get::<T1>().unwrap().0, 1);
    }

    #[test]
    fn extract_stores_by_result_type_and_returns_the_raw_value() {
        fn produce() -> T1 {
            T1(7)
        }

        let scope = Scope::new();
        let out = scope.extract(produce).unwrap();
        assert_eq!(out.0, 7);
        assert_eq!(scope.get::<T1>().unwrap().0, 7);
    }

    #[test]
    fn extracts_of_distinct_types_never_clash() {
        fn first() -> T1 {
            T1(1)
        }
        fn second() -> T2 {
            T2(2)
        }

        let scope = Scope::new();
        scope.extract(first).unwrap();
        scope.extract(second).unwrap();
        assert_eq!(scope.get::<T1>().unwrap().0, 1);
        assert_eq!(scope.get::<T2>().unwrap().0, 2);
    }

    #[test]
    fn extract_clash_is_a_hard_error() {
        fn produce() -> T1 {
            T1(1)
        }

        let scope = Scope::new();
        scope.extract(produce).unwrap();
        let err = scope.extract(produce).unwrap_err();
        assert!(matches!(err, Error::Clash { .. }));
        assert_eq!(err.to_string(), "scope already contains T1");
    }

    #[test]
    fn ignore_policy_never_mutates_the_scope() {
        fn produce() -> T1 {
            T1(1)
        }

        let scope = Scope::new();
        let out = scope
            .extract_with(produce, None, Some(Returns::Ignore))
            .unwrap();
        assert_eq!(out.0, 1);
        assert!(scope.is_empty());
    }

    #[test]
    fn unit_returns_are_never_stored() {
        fn noop() {}

        let scope = Scope::new();
        scope.extract(noop).unwrap();
        assert!(scope.is_empty());
    }

    #[test]
    fn explicit_label_restores_the_value_under_the_label() {
        fn produce() -> T1 {
            T1(3)
        }

        let scope = Scope::new();
        scope
            .extract_with(produce, None, Some(Returns::labelled("one")))
            .unwrap();
        assert!(scope.get::<T1>().is_none());
        assert_eq!(scope.get_labelled::<T1>("one").unwrap().0, 3);
    }

    #[test]
    fn batch_returns_store_each_element() {
        fn produce() -> Batch {
            Batch::new().with(T1(1)).with(T2(2))
        }

        let scope = Scope::new();
        scope.extract(produce).unwrap();
        assert_eq!(scope.get::<T1>().unwrap().0, 1);
        assert_eq!(scope.get::<T2>().unwrap().0, 2);
    }

    #[test]
    fn batch_returns_zip_against_explicit_keys() {
        fn produce() -> Batch {
            Batch::new().with(T1(1)).with(T2(2))
        }

        let scope = Scope::new();
        scope
            .extract_with(
                produce,
                None,
                Some(Returns::explicit(vec![
                    ResourceKey::label("a"),
                    ResourceKey::label("b"),
                ])),
            )
            .unwrap();
        assert_eq!(scope.get_labelled::<T1>("a").unwrap().0, 1);
        assert_eq!(scope.get_labelled::<T2>("b").unwrap().0, 2);
    }

    #[test]
    fn mapping_returns_store_their_pairs() {
        fn produce() -> ResourceMap {
            ResourceMap::new().with(T1(1)).with_labelled("two", T2(2))
        }

        let scope = Scope::new();
        scope.extract(produce).unwrap();
        assert_eq!(scope.get::<T1>().unwrap().0, 1);
        assert_eq!(scope.get_labelled::<T2>("two").unwrap().0, 2);
    }

    #[test]
    fn step_errors_propagate_unchanged() {
        fn failing() -> core::result::Result<T1, std::io::Error> {
            Err(std::io::Error::other("boom"))
        }

        let scope = Scope::new();
        let err = scope.call(fallible(failing)).unwrap_err();
        match err {
            Error::Step(source) => {
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected a propagated error, got {other}"),
        }
        // Nothing was stored on the failure path.
        assert!(scope.is_empty());
    }

    #[test]
    fn requirement_policy_applies_to_derived_requirements() {
        fn read(value: Res<i32>) -> i32 {
            *value
        }

        let scope = Scope::new();
        scope.add_label_only("val", 10_i32).unwrap();

        let nested = scope.nest_with(|need| match need.key() {
            NeedKey::Type(key) if key.id() == core::any::TypeId::of::<i32>() => {
                Need::label("val")
            }
            _ => need,
        });
        assert_eq!(nested.call(read).unwrap(), 10);

        // Explicit requirements bypass the policy.
        let err = nested
            .call_with(read, Requires::none().with(Need::of::<i32>()))
            .unwrap_err();
        assert!(matches!(err, Error::Unsatisfied { .. }));
    }

    #[test]
    fn resolvers_participate_in_calls() {
        fn read(value: Res<T1>) -> i32 {
            value.0
        }

        let scope = Scope::new();
        scope.add_resolver(|_ctx| Some(T1(13))).unwrap();
        assert_eq!(scope.call(read).unwrap(), 13);
    }

    #[test]
    fn child_scope_resolves_against_parent_resources() {
        fn read(value: Res<String>) -> String {
            value.cloned()
        }

        let scope = Scope::new();
        scope.add(String::from("root")).unwrap();
        let child = scope.nest();
        assert_eq!(child.call(read).unwrap(), "root");
    }

    #[test]
    fn erased_paths_match_typed_ones() {
        fn produce() -> T1 {
            T1(4)
        }

        let typed_scope = Scope::new();
        typed_scope.extract(produce).unwrap();

        let erased_scope = Scope::new();
        let step = crate::step::step(produce);
        let value = erased_scope
            .extract_erased(&step, None, None)
            .unwrap();
        assert_eq!(value.downcast_ref::<T1>().unwrap().0, 4);
        assert_eq!(
            typed_scope.get::<T1>().unwrap().0,
            erased_scope.get::<T1>().unwrap().0
        );
    }
}
