//! Resource keys.
//!
//! A resource is reachable through a *type key* (derived from a Rust type),
//! a *label key* (an arbitrary string), or both at once. Keys render in
//! diagnostics exactly as users wrote them: type keys by their short type
//! name, labels in single quotes.

use core::any::TypeId;
use core::fmt;

/// Identifier for a type key, carrying the `TypeId` for lookup and the type
/// name for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Creates the type key for `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: core::any::type_name::<T>(),
        }
    }

    /// Returns the underlying `TypeId`.
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Returns the full type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The trailing segment of the type path, used in rendered output.
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        // Strip module paths but keep generic arguments readable.
        match self.name.split('<').next() {
            Some(prefix) => {
                let tail = prefix.rsplit("::").next().unwrap_or(prefix);
                let offset = prefix.len() - tail.len();
                &self.name[offset..]
            }
            None => self.name,
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A label key: an owned string identifying a resource independently of its
/// type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(String);

impl Label {
    /// Creates a label from anything string-like.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the label text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Label {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self.0)
    }
}

/// One concrete index key: either a type key or a label key.
///
/// A single stored resource may be indexed under one key of each kind at
/// once; errors and removals refer to whichever key was used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// Keyed by type.
    Type(TypeKey),
    /// Keyed by label.
    Label(Label),
}

impl ResourceKey {
    /// Creates a type key for `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self::Type(TypeKey::of::<T>())
    }

    /// Creates a label key.
    pub fn label(label: impl Into<Label>) -> Self {
        Self::Label(label.into())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Type(key) => key.fmt(f),
            ResourceKey::Label(label) => label.fmt(f),
        }
    }
}

/// The lookup form of a requirement key: a type key, a label key, or both.
///
/// When both are present the label index is consulted first, then the type
/// index, in the local store before any parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupKey {
    type_key: Option<TypeKey>,
    label: Option<Label>,
}

impl LookupKey {
    /// A lookup by type only.
    #[must_use]
    pub fn by_type(key: TypeKey) -> Self {
        Self {
            type_key: Some(key),
            label: None,
        }
    }

    /// A lookup by label only.
    pub fn by_label(label: impl Into<Label>) -> Self {
        Self {
            type_key: None,
            label: Some(label.into()),
        }
    }

    /// A lookup trying the label first, then the type.
    pub fn by_both(key: TypeKey, label: impl Into<Label>) -> Self {
        Self {
            type_key: Some(key),
            label: Some(label.into()),
        }
    }

    /// A lookup with no key at all; never matches anything.
    pub(crate) fn empty() -> Self {
        Self {
            type_key: None,
            label: None,
        }
    }

    /// The type component, if any.
    #[must_use]
    pub fn type_key(&self) -> Option<&TypeKey> {
        self.type_key.as_ref()
    }

    /// The label component, if any.
    #[must_use]
    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.type_key, &self.label) {
            (Some(key), Some(label)) => write!(f, "{key} @ {label}"),
            (Some(key), None) => key.fmt(f),
            (None, Some(label)) => label.fmt(f),
            (None, None) => f.write_str("<no key>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TheType;

    #[test]
    fn type_keys_compare_by_type() {
        assert_eq!(TypeKey::of::<TheType>(), TypeKey::of::<TheType>());
        assert_ne!(TypeKey::of::<TheType>(), TypeKey::of::<String>());
    }

    #[test]
    fn short_name_strips_module_path() {
        let key = TypeKey::of::<TheType>();
        assert_eq!(key.short_name(), "TheType");
        assert_eq!(key.to_string(), "TheType");
    }

    #[test]
    fn short_name_keeps_generics() {
        let key = TypeKey::of::<Vec<TheType>>();
        assert!(key.short_name().starts_with("Vec<"));
    }

    #[test]
    fn labels_render_quoted() {
        assert_eq!(Label::new("db").to_string(), "'db'");
        assert_eq!(ResourceKey::label("db").to_string(), "'db'");
    }

    #[test]
    fn lookup_key_renders_both_parts() {
        let key = LookupKey::by_both(TypeKey::of::<TheType>(), "main");
        assert_eq!(key.to_string(), "TheType @ 'main'");
    }
}
