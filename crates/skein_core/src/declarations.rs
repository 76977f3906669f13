//! Declared requirements and return policies for steps.
//!
//! [`Requires`] is the ordered list of [`Need`]s for a step's parameters;
//! [`Returns`] decides how a step's return value is redistributed into the
//! scope. Both can come from three places, in priority order: an explicit
//! per-call argument, declarations attached to the step, or the defaults the
//! step adapter derives from its signature. Derived declarations are cached
//! per step identity in a side table owned by the scope chain; explicit
//! per-call declarations are never cached.

use core::fmt;

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::key::{Label, ResourceKey, TypeKey};
use crate::requirement::Need;
use crate::resource::ResourceValue;
use crate::step::StepId;

/// The ordered requirements of a step, one [`Need`] per parameter.
#[derive(Clone, Debug, Default)]
pub struct Requires {
    needs: Vec<Need>,
}

impl Requires {
    /// No requirements.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Appends a requirement, builder style.
    #[must_use]
    pub fn with(mut self, need: Need) -> Self {
        self.needs.push(need);
        self
    }

    /// Appends a requirement.
    pub fn push(&mut self, need: Need) {
        self.needs.push(need);
    }

    /// Number of declared requirements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.needs.len()
    }

    /// True when the step requires nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.needs.is_empty()
    }

    /// Iterates the requirements in parameter order.
    pub fn iter(&self) -> impl Iterator<Item = &Need> {
        self.needs.iter()
    }

    /// Applies a transform to every requirement, preserving order.
    #[must_use]
    pub fn map(&self, f: impl Fn(Need) -> Need) -> Self {
        Self {
            needs: self.needs.iter().cloned().map(f).collect(),
        }
    }
}

impl From<Vec<Need>> for Requires {
    fn from(needs: Vec<Need>) -> Self {
        Self { needs }
    }
}

impl FromIterator<Need> for Requires {
    fn from_iter<I: IntoIterator<Item = Need>>(iter: I) -> Self {
        Self {
            needs: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Requires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("requires(")?;
        for (i, need) in self.needs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{need}")?;
        }
        f.write_str(")")
    }
}

/// How a step's return value is redistributed into the scope.
#[derive(Clone, Debug, Default)]
pub enum Returns {
    /// Store the value under its own runtime type. A [`Batch`] stores each
    /// element under its element type; a [`ResourceMap`] stores its pairs as
    /// given. This is the default policy.
    #[default]
    ResultType,
    /// Store under the given keys. One key re-keys the whole value; several
    /// keys zip against a [`Batch`] of the same length.
    Explicit(Vec<ResourceKey>),
    /// The value must be a [`Batch`]; each element is stored under its own
    /// runtime type.
    Sequence,
    /// The value must be a [`ResourceMap`]; its pairs are stored as given.
    Mapping,
    /// Discard the return value entirely.
    Ignore,
}

impl Returns {
    /// Store the value under the type key `T`. The returned value must
    /// actually be a `T`; erased storage cannot re-key foreign types.
    #[must_use]
    pub fn typed<T: 'static>() -> Self {
        Self::Explicit(vec![ResourceKey::Type(TypeKey::of::<T>())])
    }

    /// Store the value under `label` only.
    pub fn labelled(label: impl Into<Label>) -> Self {
        Self::Explicit(vec![ResourceKey::Label(label.into())])
    }

    /// Store a batch of values under the given keys, element by element.
    #[must_use]
    pub fn explicit(keys: Vec<ResourceKey>) -> Self {
        Self::Explicit(keys)
    }

    pub(crate) fn pairs(&self, value: &ResourceValue) -> Result<Vec<ReturnedPair>> {
        let absent = value.is::<()>();
        match self {
            Returns::Ignore => Ok(Vec::new()),
            Returns::ResultType => {
                if absent {
                    Ok(Vec::new())
                } else if let Some(batch) = value.downcast_ref::<Batch>() {
                    Ok(batch.items.iter().map(ReturnedPair::by_type).collect())
                } else if let Some(map) = value.downcast_ref::<ResourceMap>() {
                    Ok(map.pairs.iter().map(ReturnedPair::from_keyed).collect())
                } else {
                    Ok(vec![ReturnedPair::by_type(value)])
                }
            }
            Returns::Sequence => {
                if absent {
                    return Ok(Vec::new());
                }
                let batch = value.downcast_ref::<Batch>().ok_or(Error::ReturnShape {
                    policy: "sequence",
                    found: value.type_key(),
                })?;
                Ok(batch.items.iter().map(ReturnedPair::by_type).collect())
            }
            Returns::Mapping => {
                let map = value.downcast_ref::<ResourceMap>().ok_or(Error::ReturnShape {
                    policy: "mapping",
                    found: value.type_key(),
                })?;
                Ok(map.pairs.iter().map(ReturnedPair::from_keyed).collect())
            }
            Returns::Explicit(keys) => {
                if absent {
                    return Ok(Vec::new());
                }
                if keys.len() == 1 {
                    return Ok(vec![ReturnedPair::rekeyed(&keys[0], value)?]);
                }
                let batch = value.downcast_ref::<Batch>().ok_or(Error::ReturnShape {
                    policy: "explicit",
                    found: value.type_key(),
                })?;
                if batch.items.len() != keys.len() {
                    return Err(Error::ReturnArity {
                        keys: keys.len(),
                        values: batch.items.len(),
                    });
                }
                keys.iter()
                    .zip(&batch.items)
                    .map(|(key, item)| ReturnedPair::rekeyed(key, item))
                    .collect()
            }
        }
    }
}

impl fmt::Display for Returns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returns::ResultType => f.write_str("returns(result type)"),
            Returns::Explicit(keys) => {
                f.write_str("returns(")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}")?;
                }
                f.write_str(")")
            }
            Returns::Sequence => f.write_str("returns(sequence)"),
            Returns::Mapping => f.write_str("returns(mapping)"),
            Returns::Ignore => f.write_str("returns(nothing)"),
        }
    }
}

/// One (key, value) pair derived from a return value.
#[derive(Debug)]
pub(crate) struct ReturnedPair {
    pub(crate) type_key: Option<TypeKey>,
    pub(crate) label: Option<Label>,
    pub(crate) value: ResourceValue,
}

impl ReturnedPair {
    fn by_type(value: &ResourceValue) -> Self {
        Self {
            type_key: Some(value.type_key()),
            label: None,
            value: value.clone(),
        }
    }

    fn from_keyed((key, value): &(ResourceKey, ResourceValue)) -> Self {
        match key {
            ResourceKey::Type(type_key) => Self {
                type_key: Some(*type_key),
                label: None,
                value: value.clone(),
            },
            ResourceKey::Label(label) => Self {
                type_key: None,
                label: Some(label.clone()),
                value: value.clone(),
            },
        }
    }

    fn rekeyed(key: &ResourceKey, value: &ResourceValue) -> Result<Self> {
        match key {
            ResourceKey::Type(declared) => {
                if declared.id() != value.type_key().id() {
                    return Err(Error::ReturnType {
                        declared: *declared,
                        found: value.type_key(),
                    });
                }
                Ok(Self {
                    type_key: Some(*declared),
                    label: None,
                    value: value.clone(),
                })
            }
            ResourceKey::Label(label) => Ok(Self {
                type_key: None,
                label: Some(label.clone()),
                value: value.clone(),
            }),
        }
    }
}

/// A heterogeneous sequence of return values, each stored under its own
/// runtime type.
#[derive(Debug, Default)]
pub struct Batch {
    items: Vec<ResourceValue>,
}

impl Batch {
    /// An empty batch; storing it is a no-op.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value, builder style.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.push(value);
        self
    }

    /// Appends a value.
    pub fn push<T: Send + Sync + 'static>(&mut self, value: T) {
        self.items.push(ResourceValue::new(value));
    }

    /// Number of values in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the batch holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An explicit mapping of keys to return values, stored as given.
#[derive(Debug, Default)]
pub struct ResourceMap {
    pairs: Vec<(ResourceKey, ResourceValue)>,
}

impl ResourceMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value under its type key, builder style.
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// Adds a value under `label`, builder style.
    #[must_use]
    pub fn with_labelled<T: Send + Sync + 'static>(
        mut self,
        label: impl Into<Label>,
        value: T,
    ) -> Self {
        self.insert_labelled(label, value);
        self
    }

    /// Adds a value under its type key.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.pairs
            .push((ResourceKey::of::<T>(), ResourceValue::new(value)));
    }

    /// Adds a value under `label`.
    pub fn insert_labelled<T: Send + Sync + 'static>(
        &mut self,
        label: impl Into<Label>,
        value: T,
    ) {
        self.pairs
            .push((ResourceKey::label(label), ResourceValue::new(value)));
    }

    /// Number of pairs in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when the map holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Cached declarations, keyed by step identity. Owned by the root scope and
/// shared with every nested scope.
#[derive(Default)]
pub(crate) struct DeclarationCache {
    map: HashMap<StepId, CachedDecl>,
}

#[derive(Clone)]
pub(crate) struct CachedDecl {
    pub(crate) requires: Requires,
    pub(crate) returns: Returns,
}

impl DeclarationCache {
    pub(crate) fn get(&self, id: StepId) -> Option<CachedDecl> {
        self.map.get(&id).cloned()
    }

    pub(crate) fn insert(&mut self, id: StepId, decl: CachedDecl) {
        self.map.insert(id, decl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct T1(i32);
    #[derive(Debug, PartialEq)]
    struct T2(i32);

    fn pair_keys(pairs: &[ReturnedPair]) -> Vec<String> {
        pairs
            .iter()
            .map(|p| match (&p.type_key, &p.label) {
                (Some(t), None) => t.to_string(),
                (None, Some(l)) => l.to_string(),
                other => panic!("unexpected pair keys: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn result_type_stores_by_runtime_type() {
        let value = ResourceValue::new(T1(1));
        let pairs = Returns::ResultType.pairs(&value).unwrap();
        assert_eq!(pair_keys(&pairs), ["T1"]);
    }

    #[test]
    fn unit_return_is_ignored_by_every_policy_but_mapping() {
        let value = ResourceValue::new(());
        assert!(Returns::ResultType.pairs(&value).unwrap().is_empty());
        assert!(Returns::Sequence.pairs(&value).unwrap().is_empty());
        assert!(Returns::labelled("x").pairs(&value).unwrap().is_empty());
        assert!(Returns::Ignore.pairs(&value).unwrap().is_empty());
        assert!(matches!(
            Returns::Mapping.pairs(&value),
            Err(Error::ReturnShape { .. })
        ));
    }

    #[test]
    fn batch_unpacks_under_result_type_and_sequence() {
        let value = ResourceValue::new(Batch::new().with(T1(1)).with(T2(2)));
        for policy in [Returns::ResultType, Returns::Sequence] {
            let pairs = policy.pairs(&value).unwrap();
            assert_eq!(pair_keys(&pairs), ["T1", "T2"]);
        }
    }

    #[test]
    fn sequence_rejects_non_batch() {
        let value = ResourceValue::new(T1(1));
        assert!(matches!(
            Returns::Sequence.pairs(&value),
            Err(Error::ReturnShape { policy: "sequence", .. })
        ));
    }

    #[test]
    fn mapping_pairs_are_used_directly() {
        let value = ResourceValue::new(
            ResourceMap::new()
                .with(T1(1))
                .with_labelled("two", T2(2)),
        );
        let pairs = Returns::Mapping.pairs(&value).unwrap();
        assert_eq!(pair_keys(&pairs), ["T1", "'two'"]);
        let pairs = Returns::ResultType.pairs(&value).unwrap();
        assert_eq!(pair_keys(&pairs), ["T1", "'two'"]);
    }

    #[test]
    fn explicit_label_rekeys_a_single_value() {
        let value = ResourceValue::new(T1(1));
        let pairs = Returns::labelled("one").pairs(&value).unwrap();
        assert_eq!(pair_keys(&pairs), ["'one'"]);
    }

    #[test]
    fn explicit_type_key_must_match_the_value() {
        let value = ResourceValue::new(T1(1));
        assert!(Returns::typed::<T1>().pairs(&value).is_ok());
        assert!(matches!(
            Returns::typed::<T2>().pairs(&value),
            Err(Error::ReturnType { .. })
        ));
    }

    #[test]
    fn explicit_keys_zip_against_a_batch() {
        let value = ResourceValue::new(Batch::new().with(T1(1)).with(T2(2)));
        let pairs = Returns::explicit(vec![
            ResourceKey::label("a"),
            ResourceKey::label("b"),
        ])
        .pairs(&value)
        .unwrap();
        assert_eq!(pair_keys(&pairs), ["'a'", "'b'"]);

        let err = Returns::explicit(vec![ResourceKey::label("a"), ResourceKey::label("b"), ResourceKey::label("c")])
            .pairs(&value)
            .unwrap_err();
        assert!(matches!(err, Error::ReturnArity { keys: 3, values: 2 }));
    }

    #[test]
    fn display_forms() {
        let requires = Requires::none()
            .with(Need::of::<T1>())
            .with(Need::label("x").target("x"));
        assert_eq!(requires.to_string(), "requires(Need(T1), x=Need('x'))");
        assert_eq!(Returns::ResultType.to_string(), "returns(result type)");
        assert_eq!(Returns::labelled("x").to_string(), "returns('x')");
        assert_eq!(
            Returns::explicit(vec![ResourceKey::of::<T1>(), ResourceKey::label("x")]).to_string(),
            "returns(T1, 'x')"
        );
    }
}
