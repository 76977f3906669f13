//! The ordered pipeline.
//!
//! A [`Runner`] holds registered steps, each tagged with an ordering class
//! ([`Order`]) and optionally grouped under a type key. Execution applies a
//! stable sort that places every `First` step before every `Default` step
//! before every `Last` step, with registration order preserved inside each
//! class, then extracts each step against one shared scope so later steps
//! see earlier steps' stored results.
//!
//! A resolution failure aborts the run with an error naming the failing
//! step and the unmet requirement; resources stored by earlier steps stay
//! in the scope. Errors raised by the steps themselves pass through
//! unchanged.
//!
//! # Example
//!
//! ```
//! use skein_runner::prelude::*;
//!
//! struct Parsed { jobs: usize }
//!
//! fn parse() -> Parsed {
//!     Parsed { jobs: 2 }
//! }
//!
//! fn work(parsed: Res<Parsed>) -> usize {
//!     parsed.jobs * 10
//! }
//!
//! let mut runner = Runner::new();
//! runner.add(work);
//! runner.add(parse).first();
//!
//! let scope = runner.run().unwrap();
//! assert_eq!(*scope.get::<usize>().unwrap(), 20);
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use skein_core::declarations::{Requires, Returns};
use skein_core::error::{Error, Result};
use skein_core::key::TypeKey;
use skein_core::scope::Scope;
use skein_core::step::{ErasedStep, IntoStep};

use crate::engine::{AsyncScope, ErasedAsyncStep, IntoAsyncStep};

/// Ordering class of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Runs before every `Default` and `Last` step.
    First,
    /// The unordered middle; steps run in registration order.
    #[default]
    Default,
    /// Runs after every `First` and `Default` step.
    Last,
}

impl Order {
    fn rank(self) -> u8 {
        match self {
            Order::First => 0,
            Order::Default => 1,
            Order::Last => 2,
        }
    }
}

#[derive(Clone)]
enum StepKind {
    Blocking(Arc<dyn ErasedStep>),
    Suspending(Arc<dyn ErasedAsyncStep>),
}

impl StepKind {
    fn name(&self) -> &str {
        match self {
            StepKind::Blocking(step) => step.name(),
            StepKind::Suspending(step) => step.name(),
        }
    }

    fn is_suspending(&self) -> bool {
        matches!(self, StepKind::Suspending(_))
    }
}

#[derive(Clone)]
struct Entry {
    kind: StepKind,
    requires: Option<Requires>,
    returns: Option<Returns>,
    order: Order,
    group: Option<TypeKey>,
}

/// An ordered pipeline of steps sharing one scope.
#[derive(Clone, Default)]
pub struct Runner {
    entries: Vec<Entry>,
}

/// Configuration handle for a just-registered pipeline step.
pub struct EntryMut<'a> {
    entry: &'a mut Entry,
}

impl EntryMut<'_> {
    /// Places the step in the `First` ordering class.
    pub fn first(self) -> Self {
        self.entry.order = Order::First;
        self
    }

    /// Places the step in the `Last` ordering class.
    pub fn last(self) -> Self {
        self.entry.order = Order::Last;
        self
    }

    /// Associates the step's ordering tag with the type key `T`, for
    /// diagnostics and pipeline rendering. Steps without a group belong to
    /// the global ordering group.
    pub fn grouped<T: 'static>(self) -> Self {
        self.entry.group = Some(TypeKey::of::<T>());
        self
    }

    /// Overrides the step's requirements for this pipeline entry.
    pub fn requires(self, requires: Requires) -> Self {
        self.entry.requires = Some(requires);
        self
    }

    /// Overrides the step's return policy for this pipeline entry.
    pub fn returns(self, returns: Returns) -> Self {
        self.entry.returns = Some(returns);
        self
    }
}

impl Runner {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a blocking step in the `Default` ordering class; configure
    /// it through the returned handle.
    pub fn add<Marker, S>(&mut self, step: S) -> EntryMut<'_>
    where
        S: IntoStep<Marker>,
    {
        self.push(StepKind::Blocking(Arc::new(step.into_step())))
    }

    /// Registers a suspending step; the pipeline then requires a scheduler
    /// to run (see [`run_on`](Self::run_on)).
    pub fn add_async<Marker, S>(&mut self, step: S) -> EntryMut<'_>
    where
        S: IntoAsyncStep<Marker>,
    {
        self.push(StepKind::Suspending(Arc::new(step.into_async_step())))
    }

    fn push(&mut self, kind: StepKind) -> EntryMut<'_> {
        self.entries.push(Entry {
            kind,
            requires: None,
            returns: None,
            order: Order::Default,
            group: None,
        });
        EntryMut {
            entry: self.entries.last_mut().expect("entry was just pushed"),
        }
    }

    /// Appends every entry of `other`, keeping their ordering tags and
    /// overrides.
    pub fn extend(&mut self, other: &Runner) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// Number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no steps are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The execution order: a stable sort by ordering class over the
    /// registration order.
    fn ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        entries.sort_by_key(|entry| entry.order.rank());
        entries
    }

    /// The step names in execution order, for inspection and tests.
    #[must_use]
    pub fn plan(&self) -> Vec<String> {
        self.ordered()
            .into_iter()
            .map(|entry| entry.kind.name().to_owned())
            .collect()
    }

    /// Runs the pipeline on the blocking engine against a fresh scope,
    /// returning it with every step's stored results.
    ///
    /// # Errors
    ///
    /// [`Error::AtStep`] naming the failing step for resolution and storage
    /// failures; step errors pass through unchanged. [`Error::Suspending`]
    /// if any suspending step is registered.
    pub fn run(&self) -> Result<Scope> {
        let scope = Scope::new();
        self.run_in(&scope)?;
        Ok(scope)
    }

    /// Runs the pipeline on the blocking engine against an existing scope.
    ///
    /// # Errors
    ///
    /// As for [`run`](Self::run).
    pub fn run_in(&self, scope: &Scope) -> Result<()> {
        if let Some(entry) = self.entries.iter().find(|entry| entry.kind.is_suspending()) {
            return Err(Error::Suspending {
                what: format!("step {}", entry.kind.name()),
            });
        }
        for entry in self.ordered() {
            debug!(step = entry.kind.name(), "running step");
            match &entry.kind {
                StepKind::Blocking(step) => {
                    scope
                        .extract_erased(&**step, entry.requires.as_ref(), entry.returns.as_ref())
                        .map_err(|error| at_step(step.name(), error))?;
                }
                StepKind::Suspending(_) => unreachable!("checked above"),
            }
        }
        Ok(())
    }

    /// Runs the pipeline on the suspending engine against a fresh scope.
    /// Blocking steps run on the scheduler's worker pool; ordering and
    /// storage effects are identical to [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// As for [`run`](Self::run), except that suspending steps are driven
    /// rather than rejected.
    pub async fn run_on(&self, handle: &Handle) -> Result<Scope> {
        let scope = Scope::new();
        self.run_in_on(&scope, handle).await?;
        Ok(scope)
    }

    /// Runs the pipeline on the suspending engine against an existing
    /// scope.
    ///
    /// # Errors
    ///
    /// As for [`run_on`](Self::run_on).
    pub async fn run_in_on(&self, scope: &Scope, handle: &Handle) -> Result<()> {
        let engine = AsyncScope::new(scope.clone(), handle.clone());
        for entry in self.ordered() {
            debug!(step = entry.kind.name(), "running step");
            let outcome = match &entry.kind {
                StepKind::Blocking(step) => {
                    engine
                        .extract_erased_blocking(
                            Arc::clone(step),
                            entry.requires.as_ref(),
                            entry.returns.as_ref(),
                        )
                        .await
                }
                StepKind::Suspending(step) => {
                    engine
                        .extract_erased_async(
                            &**step,
                            entry.requires.as_ref(),
                            entry.returns.as_ref(),
                        )
                        .await
                }
            };
            outcome.map_err(|error| at_step(entry.kind.name(), error))?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for Runner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut list = f.debug_list();
        for entry in self.ordered() {
            let tag = match (entry.order, &entry.group) {
                (Order::Default, None) => entry.kind.name().to_owned(),
                (order, None) => format!("{} ({order:?})", entry.kind.name()),
                (order, Some(group)) => {
                    format!("{} ({order:?} for {group})", entry.kind.name())
                }
            };
            list.entry(&tag);
        }
        list.finish()
    }
}

fn at_step(name: &str, error: Error) -> Error {
    match error {
        // Step failures propagate unchanged; everything else gets the
        // failing step's name attached.
        Error::Step(_) => error,
        other => Error::AtStep {
            step: name.to_owned(),
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::prelude::*;

    #[derive(Debug, PartialEq, Clone)]
    struct T1(i32);
    #[derive(Debug, PartialEq, Clone)]
    struct T2(i32);

    fn produce_one() -> T1 {
        T1(1)
    }

    fn consume_one(one: Res<T1>) -> T2 {
        T2(one.0 + 1)
    }

    #[test]
    fn chained_steps_share_one_scope() {
        let mut runner = Runner::new();
        runner.add(produce_one);
        runner.add(consume_one);

        let scope = runner.run().unwrap();
        assert_eq!(scope.get::<T1>().unwrap().0, 1);
        assert_eq!(scope.get::<T2>().unwrap().0, 2);
    }

    #[test]
    fn first_and_last_override_registration_order() {
        let mut runner = Runner::new();
        runner.add(consume_one);
        runner.add(produce_one).first();

        let scope = runner.run().unwrap();
        assert_eq!(scope.get::<T2>().unwrap().0, 2);
    }

    #[test]
    fn plan_is_a_stable_sort_by_class() {
        fn a() {}
        fn b() {}
        fn c() {}
        fn d() {}

        let mut runner = Runner::new();
        runner.add(a).last();
        runner.add(b);
        runner.add(c).first();
        runner.add(d);

        let plan = runner.plan();
        let positions: Vec<usize> = ["::c", "::b", "::d", "::a"]
            .iter()
            .map(|suffix| {
                plan.iter()
                    .position(|name| name.ends_with(suffix))
                    .expect("step is in the plan")
            })
            .collect();
        assert_eq!(positions, [0, 1, 2, 3]);
    }

    #[test]
    fn missing_dependency_names_step_and_requirement() {
        let mut runner = Runner::new();
        runner.add(consume_one);

        let err = runner.run().unwrap_err();
        assert!(err.is_unsatisfied());
        let rendered = err.to_string();
        assert!(rendered.contains("consume_one"));
        assert!(rendered.contains("Need(T1)"));
    }

    #[test]
    fn no_rollback_after_a_failing_step() {
        let scope = Scope::new();
        let mut runner = Runner::new();
        runner.add(produce_one);
        runner.add(consume_one);
        runner.add(|_missing: Res<String>| ());

        runner.run_in(&scope).unwrap_err();
        // Results stored before the failure stay in place.
        assert_eq!(scope.get::<T1>().unwrap().0, 1);
        assert_eq!(scope.get::<T2>().unwrap().0, 2);
    }

    #[test]
    fn step_errors_pass_through_without_step_context() {
        fn failing() -> core::result::Result<T1, std::io::Error> {
            Err(std::io::Error::other("boom"))
        }

        let mut runner = Runner::new();
        runner.add(fallible(failing));

        let err = runner.run().unwrap_err();
        assert!(matches!(err, Error::Step(_)));
    }

    #[test]
    fn suspending_steps_are_rejected_by_the_blocking_run() {
        async fn produce() -> T1 {
            T1(1)
        }

        let mut runner = Runner::new();
        runner.add_async(produce);

        let err = runner.run().unwrap_err();
        assert!(matches!(err, Error::Suspending { .. }));
    }

    #[test]
    fn entry_overrides_apply_per_step() {
        fn read(x: Res<i32>) -> i32 {
            *x
        }

        let scope = Scope::new();
        scope.add_label_only("x", 41_i32).unwrap();

        let mut runner = Runner::new();
        runner
            .add(read)
            .requires(requires![Need::label("x")])
            .returns(Returns::labelled("answer"));

        runner.run_in(&scope).unwrap();
        assert_eq!(*scope.get_labelled::<i32>("answer").unwrap(), 41);
    }

    #[test]
    fn extend_preserves_tags() {
        let mut base = Runner::new();
        base.add(produce_one).first();

        let mut runner = Runner::new();
        runner.add(consume_one);
        runner.extend(&base);
        assert_eq!(runner.len(), 2);

        let scope = runner.run().unwrap();
        assert_eq!(scope.get::<T2>().unwrap().0, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mixed_pipeline_runs_on_the_suspending_engine() {
        async fn produce() -> T1 {
            T1(20)
        }

        fn consume(one: Res<T1>) -> T2 {
            T2(one.0 + 2)
        }

        let mut runner = Runner::new();
        runner.add(consume);
        runner.add_async(produce).first();

        let scope = runner.run_on(&Handle::current()).await.unwrap();
        assert_eq!(scope.get::<T2>().unwrap().0, 22);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn both_engines_produce_identical_scopes() {
        let mut runner = Runner::new();
        runner.add(produce_one);
        runner.add(consume_one);

        let blocking = runner.run().unwrap();
        let suspending = runner.run_on(&Handle::current()).await.unwrap();

        assert_eq!(
            blocking.get::<T1>().unwrap().0,
            suspending.get::<T1>().unwrap().0
        );
        assert_eq!(
            blocking.get::<T2>().unwrap().0,
            suspending.get::<T2>().unwrap().0
        );
    }
}
