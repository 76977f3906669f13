//! Error taxonomy for the resolution engine.
//!
//! Failures fall into four kinds:
//!
//! - clashes: a key registered twice in the same local scope ([`Error::Clash`])
//! - resolution failures: a mandatory requirement that cannot be satisfied
//!   ([`Error::Unsatisfied`], wrapped with the failing step by the pipeline)
//! - usage errors: malformed declarations detected at the point of use
//!   ([`Error::Suspending`], [`Error::Inject`], the arity and return-shape
//!   variants)
//! - propagated errors: whatever a user step or resolver returned, passed
//!   through unchanged as [`Error::Step`]

use crate::key::{ResourceKey, TypeKey};

/// Convenience alias used throughout the engine.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by scopes, requirement resolution, and pipeline runs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A key was registered twice in the same local scope.
    ///
    /// Resources are immutable once stored; replacing one is always an error,
    /// never a silent overwrite.
    #[error("scope already contains {key}")]
    Clash {
        /// The key that was already present.
        key: ResourceKey,
    },

    /// A strict removal did not find the key in the local scope.
    #[error("no {key} in scope")]
    NotFound {
        /// The key that was absent.
        key: ResourceKey,
    },

    /// A mandatory requirement could not be satisfied.
    #[error("{requirement} could not be satisfied")]
    Unsatisfied {
        /// Rendered form of the unmet requirement, including its key and
        /// any modifier ops.
        requirement: String,
    },

    /// A pipeline step failed; wraps the underlying resolution error with
    /// the step's name.
    #[error("while calling {step}: {source}")]
    AtStep {
        /// Name of the failing step.
        step: String,
        /// The underlying failure.
        source: Box<Error>,
    },

    /// A suspending facility (resolver, custom resolution step, step, or the
    /// blocking bridge) was reached from the blocking engine, which has no
    /// scheduler to drive it.
    #[error("{what} suspends and cannot be driven by the blocking engine")]
    Suspending {
        /// What suspends: a requirement, provider, or step name.
        what: String,
    },

    /// A resolved value could not be injected into the parameter that
    /// required it. Usually an explicit requirement override whose key
    /// resolves to a different type than the parameter expects.
    #[error("resolved {found} cannot be injected as {expected}")]
    Inject {
        /// The parameter's type.
        expected: TypeKey,
        /// The runtime type of the resolved value.
        found: TypeKey,
    },

    /// The number of resolved arguments did not match the step's parameters.
    #[error("step takes {expected} arguments but {found} were resolved")]
    Arity {
        /// Declared parameter count.
        expected: usize,
        /// Resolved argument count.
        found: usize,
    },

    /// A returns policy was applied to a value of the wrong shape, e.g.
    /// `Returns::Sequence` on something that is not a [`Batch`].
    ///
    /// [`Batch`]: crate::declarations::Batch
    #[error("returns policy {policy} cannot process a value of type {found}")]
    ReturnShape {
        /// The policy that rejected the value.
        policy: &'static str,
        /// The runtime type of the returned value.
        found: TypeKey,
    },

    /// Explicit return keys were zipped against a batch of a different length.
    #[error("{keys} return keys declared but {values} values were returned")]
    ReturnArity {
        /// Number of declared keys.
        keys: usize,
        /// Number of returned values.
        values: usize,
    },

    /// An explicit return key re-typed a value to a type it does not have.
    /// Erased storage cannot soundly re-key a value under a foreign type;
    /// use a newtype or a label instead.
    #[error("cannot store a {found} under the {declared} type key")]
    ReturnType {
        /// The declared type key.
        declared: TypeKey,
        /// The value's runtime type.
        found: TypeKey,
    },

    /// An error returned by a user step or custom resolver, propagated
    /// unchanged.
    #[error(transparent)]
    Step(#[from] anyhow::Error),
}

impl Error {
    /// True when this error (or, for [`Error::AtStep`], its source) is a
    /// resolution failure rather than a propagated step error.
    #[must_use]
    pub fn is_unsatisfied(&self) -> bool {
        match self {
            Error::Unsatisfied { .. } => true,
            Error::AtStep { source, .. } => source.is_unsatisfied(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Label, TypeKey};

    struct Widget;

    #[test]
    fn clash_names_the_key() {
        let err = Error::Clash {
            key: ResourceKey::of::<Widget>(),
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("scope already contains"));
        assert!(rendered.contains("Widget"));
    }

    #[test]
    fn not_found_names_the_label() {
        let err = Error::NotFound {
            key: ResourceKey::Label(Label::new("db")),
        };
        assert_eq!(err.to_string(), "no 'db' in scope");
    }

    #[test]
    fn at_step_nests_resolution_failures() {
        let err = Error::AtStep {
            step: "parse".into(),
            source: Box::new(Error::Unsatisfied {
                requirement: "Need(Widget)".into(),
            }),
        };
        assert!(err.is_unsatisfied());
        assert_eq!(
            err.to_string(),
            "while calling parse: Need(Widget) could not be satisfied"
        );
    }

    #[test]
    fn step_errors_pass_through_unchanged() {
        let original = anyhow::anyhow!("backend unreachable");
        let err = Error::Step(original);
        assert!(!err.is_unsatisfied());
        assert_eq!(err.to_string(), "backend unreachable");
    }

    #[test]
    fn inject_names_both_types() {
        let err = Error::Inject {
            expected: TypeKey::of::<String>(),
            found: TypeKey::of::<Widget>(),
        };
        assert!(err.to_string().contains("String"));
        assert!(err.to_string().contains("Widget"));
    }
}
