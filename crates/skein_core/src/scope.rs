//! Scoped resource storage.
//!
//! A [`Scope`] stores resources for a particular run. Scopes are cheap
//! handles over shared state, so steps can receive the scope they are being
//! resolved against as an ordinary argument. Lookup checks the local store
//! first and falls back to the parent chain; additions are always local, and
//! adding a key that already exists locally is a clash, never an overwrite.
//!
//! # Example
//!
//! ```
//! use skein_core::scope::Scope;
//!
//! struct Config { url: String }
//!
//! let scope = Scope::new();
//! scope.add(Config { url: "nats://localhost".into() }).unwrap();
//!
//! let child = scope.nest();
//! assert!(child.get::<Config>().is_some());
//! ```

use core::any::TypeId;
use core::fmt;
use core::future::Future;
use std::sync::Arc;

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::declarations::DeclarationCache;
use crate::error::{Error, Result};
use crate::key::{Label, LookupKey, ResourceKey, TypeKey};
use crate::requirement::Need;
use crate::resource::{Found, Provider, ProviderCtx, ResourceEntry, ResourceValue, Stored};
use crate::step::Res;

/// A scope-owned transform applied to inferred requirements before they are
/// resolved, letting a nested scope change how plain parameters are
/// satisfied (e.g. pulling values out of a request object).
pub type RequirementPolicy = Arc<dyn Fn(Need) -> Need + Send + Sync>;

/// Insertion-ordered storage with one entry list and two indices.
#[derive(Default)]
struct Store {
    entries: IndexMap<u64, ResourceEntry>,
    by_type: HashMap<TypeId, u64>,
    by_label: HashMap<Label, u64>,
    next: u64,
}

struct ScopeInner {
    parent: Option<Scope>,
    store: RwLock<Store>,
    declarations: Arc<RwLock<DeclarationCache>>,
    policy: Option<RequirementPolicy>,
}

/// A keyed store of resources with optional parent fallback.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Creates a new root scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                parent: None,
                store: RwLock::new(Store::default()),
                declarations: Arc::new(RwLock::new(DeclarationCache::default())),
                policy: None,
            }),
        }
    }

    /// Creates a child scope with its own local store.
    ///
    /// The child sees the parent's resources unless it shadows them, shares
    /// the parent's declaration cache, and inherits its requirement policy.
    #[must_use]
    pub fn nest(&self) -> Scope {
        Self {
            inner: Arc::new(ScopeInner {
                parent: Some(self.clone()),
                store: RwLock::new(Store::default()),
                declarations: Arc::clone(&self.inner.declarations),
                policy: self.inner.policy.clone(),
            }),
        }
    }

    /// Like [`nest`](Self::nest), but with its own requirement policy.
    #[must_use]
    pub fn nest_with(&self, policy: impl Fn(Need) -> Need + Send + Sync + 'static) -> Scope {
        Self {
            inner: Arc::new(ScopeInner {
                parent: Some(self.clone()),
                store: RwLock::new(Store::default()),
                declarations: Arc::clone(&self.inner.declarations),
                policy: Some(Arc::new(policy)),
            }),
        }
    }

    /// The parent scope, if this is a nested scope.
    #[must_use]
    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    pub(crate) fn policy(&self) -> Option<&RequirementPolicy> {
        self.inner.policy.as_ref()
    }

    pub(crate) fn declarations(&self) -> &RwLock<DeclarationCache> {
        &self.inner.declarations
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────

    /// Registers `value` under its own type key.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if the type key already exists in this scope.
    pub fn add<T: Send + Sync + 'static>(&self, value: T) -> Result<()> {
        self.insert_entry(
            Stored::Value(ResourceValue::new(value)),
            Some(TypeKey::of::<T>()),
            None,
        )
    }

    /// Registers `value` under both its type key and `label`; the same
    /// resource is reachable through either.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if either key already exists in this scope.
    pub fn add_labelled<T: Send + Sync + 'static>(
        &self,
        label: impl Into<Label>,
        value: T,
    ) -> Result<()> {
        self.insert_entry(
            Stored::Value(ResourceValue::new(value)),
            Some(TypeKey::of::<T>()),
            Some(label.into()),
        )
    }

    /// Registers `value` under `label` only, leaving its type unindexed.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if the label already exists in this scope.
    pub fn add_label_only<T: Send + Sync + 'static>(
        &self,
        label: impl Into<Label>,
        value: T,
    ) -> Result<()> {
        self.insert_entry(
            Stored::Value(ResourceValue::new(value)),
            None,
            Some(label.into()),
        )
    }

    /// Registers a blocking provider for `T`, invoked on every lookup.
    ///
    /// The store never memoizes provider results; a provider that wants
    /// caching must memoize on its own.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if the type key already exists in this scope.
    pub fn add_resolver<T, F>(&self, f: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ProviderCtx) -> Option<T> + Send + Sync + 'static,
    {
        self.insert_entry(
            Stored::Provider(Provider::blocking(f)),
            Some(TypeKey::of::<T>()),
            None,
        )
    }

    /// Registers a blocking provider under both `T` and `label`.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if either key already exists in this scope.
    pub fn add_labelled_resolver<T, F>(&self, label: impl Into<Label>, f: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ProviderCtx) -> Option<T> + Send + Sync + 'static,
    {
        self.insert_entry(
            Stored::Provider(Provider::blocking(f)),
            Some(TypeKey::of::<T>()),
            Some(label.into()),
        )
    }

    /// Registers a suspending provider for `T`. Only the suspending engine
    /// (or the blocking bridge) can invoke it.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if the type key already exists in this scope.
    pub fn add_async_resolver<T, F, Fut>(&self, f: F) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ProviderCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        self.insert_entry(
            Stored::Provider(Provider::suspending(f)),
            Some(TypeKey::of::<T>()),
            None,
        )
    }

    /// Registers a suspending provider under both `T` and `label`.
    ///
    /// # Errors
    ///
    /// [`Error::Clash`] if either key already exists in this scope.
    pub fn add_labelled_async_resolver<T, F, Fut>(
        &self,
        label: impl Into<Label>,
        f: F,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ProviderCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        self.insert_entry(
            Stored::Provider(Provider::suspending(f)),
            Some(TypeKey::of::<T>()),
            Some(label.into()),
        )
    }

    pub(crate) fn insert_entry(
        &self,
        stored: Stored,
        type_key: Option<TypeKey>,
        label: Option<Label>,
    ) -> Result<()> {
        let mut store = self.inner.store.write();
        if let Some(key) = &type_key {
            if store.by_type.contains_key(&key.id()) {
                return Err(Error::Clash {
                    key: ResourceKey::Type(*key),
                });
            }
        }
        if let Some(label) = &label {
            if store.by_label.contains_key(label) {
                return Err(Error::Clash {
                    key: ResourceKey::Label(label.clone()),
                });
            }
        }

        let id = store.next;
        store.next += 1;
        if let Some(key) = &type_key {
            store.by_type.insert(key.id(), id);
        }
        if let Some(label) = &label {
            store.by_label.insert(label.clone(), id);
        }
        let entry = ResourceEntry {
            stored,
            type_key,
            label,
        };
        debug!(entry = %render_entry(&entry), "resource added");
        store.entries.insert(id, entry);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────

    /// Locates the entry for `key` without invoking providers, checking the
    /// local store then the parent chain. When the key carries both a label
    /// and a type, the label index is consulted first at each level.
    #[must_use]
    pub fn find(&self, key: &LookupKey) -> Option<Found> {
        let mut current = Some(self);
        while let Some(scope) = current {
            let store = scope.inner.store.read();
            let id = key
                .label()
                .and_then(|label| store.by_label.get(label))
                .or_else(|| key.type_key().and_then(|t| store.by_type.get(&t.id())));
            if let Some(id) = id {
                return store.entries.get(id).map(|entry| match &entry.stored {
                    Stored::Value(value) => Found::Value(value.clone()),
                    Stored::Provider(provider) => Found::Provider(provider.clone()),
                });
            }
            drop(store);
            current = scope.parent();
        }
        None
    }

    fn lookup_typed<T: Send + Sync + 'static>(&self, key: LookupKey) -> Result<Option<Res<T>>> {
        let raw = match self.find(&key) {
            Some(Found::Value(value)) => Some(value),
            Some(Found::Provider(provider)) => {
                provider.invoke_blocking(ProviderCtx::new(self.clone(), None))?
            }
            None => None,
        };
        Ok(raw.and_then(|value| value.downcast::<T>()).map(Res::from_arc))
    }

    /// Returns the resource of type `T`, if present anywhere in the scope
    /// chain. Missing keys are `None`, never an error; lookup failures that
    /// are not plain misses (e.g. a suspending provider reached from
    /// blocking code) are logged and reported as `None` too. Use
    /// [`try_get`](Self::try_get) to observe them.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Res<T>> {
        flatten_lookup(self.try_get::<T>())
    }

    /// Returns the resource under `label`, downcast to `T`.
    #[must_use]
    pub fn get_labelled<T: Send + Sync + 'static>(&self, label: impl Into<Label>) -> Option<Res<T>> {
        flatten_lookup(self.try_get_labelled::<T>(label))
    }

    /// Like [`get`](Self::get), surfacing provider failures.
    ///
    /// # Errors
    ///
    /// [`Error::Suspending`] when the lookup hits a suspending provider.
    pub fn try_get<T: Send + Sync + 'static>(&self) -> Result<Option<Res<T>>> {
        self.lookup_typed(LookupKey::by_type(TypeKey::of::<T>()))
    }

    /// Like [`get_labelled`](Self::get_labelled), surfacing provider
    /// failures.
    ///
    /// # Errors
    ///
    /// [`Error::Suspending`] when the lookup hits a suspending provider.
    pub fn try_get_labelled<T: Send + Sync + 'static>(
        &self,
        label: impl Into<Label>,
    ) -> Result<Option<Res<T>>> {
        self.lookup_typed(LookupKey::by_label(label))
    }

    /// True when a resource of type `T` is reachable from this scope.
    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.find(&LookupKey::by_type(TypeKey::of::<T>())).is_some()
    }

    /// True when a resource under `label` is reachable from this scope.
    #[must_use]
    pub fn contains_labelled(&self, label: impl Into<Label>) -> bool {
        self.find(&LookupKey::by_label(label)).is_some()
    }

    /// Number of entries in the local store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.store.read().entries.len()
    }

    /// True when the local store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.store.read().entries.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────

    /// Removes the local entry indexed under `T`, unindexing it from both
    /// its keys.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no such local entry exists.
    pub fn remove<T: Send + Sync + 'static>(&self) -> Result<()> {
        if self.discard::<T>() {
            Ok(())
        } else {
            Err(Error::NotFound {
                key: ResourceKey::of::<T>(),
            })
        }
    }

    /// Removes the local entry indexed under `label`, unindexing it from
    /// both its keys.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no such local entry exists.
    pub fn remove_labelled(&self, label: impl Into<Label>) -> Result<()> {
        let label = label.into();
        if self.discard_labelled(label.clone()) {
            Ok(())
        } else {
            Err(Error::NotFound {
                key: ResourceKey::Label(label),
            })
        }
    }

    /// Non-strict removal by type key; returns whether an entry was removed.
    pub fn discard<T: Send + Sync + 'static>(&self) -> bool {
        let mut store = self.inner.store.write();
        let id = store.by_type.get(&TypeId::of::<T>()).copied();
        match id {
            Some(id) => {
                remove_entry(&mut store, id);
                true
            }
            None => false,
        }
    }

    /// Non-strict removal by label key; returns whether an entry was removed.
    pub fn discard_labelled(&self, label: impl Into<Label>) -> bool {
        let mut store = self.inner.store.write();
        let id = store.by_label.get(&label.into()).copied();
        match id {
            Some(id) => {
                remove_entry(&mut store, id);
                true
            }
            None => false,
        }
    }
}

fn flatten_lookup<T>(looked_up: Result<Option<Res<T>>>) -> Option<Res<T>> {
    match looked_up {
        Ok(found) => found,
        Err(error) => {
            tracing::warn!(%error, "lookup failed; treating the key as missing");
            None
        }
    }
}

fn remove_entry(store: &mut Store, id: u64) {
    if let Some(entry) = store.entries.shift_remove(&id) {
        if let Some(key) = &entry.type_key {
            store.by_type.remove(&key.id());
        }
        if let Some(label) = &entry.label {
            store.by_label.remove(label);
        }
        debug!(entry = %render_entry(&entry), "resource removed");
    }
}

fn render_entry(entry: &ResourceEntry) -> String {
    let keys = match (&entry.type_key, &entry.label) {
        (Some(key), Some(label)) => format!("{key} @ {label}"),
        (Some(key), None) => key.to_string(),
        (None, Some(label)) => label.to_string(),
        (None, None) => "<unkeyed>".to_string(),
    };
    match &entry.stored {
        Stored::Value(value) => format!("{keys}: {value:?}"),
        Stored::Provider(provider) => format!("{keys}: {provider:?}"),
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.inner.store.read();
        if store.entries.is_empty() {
            return f.write_str("<Scope: {}>");
        }
        f.write_str("<Scope: {")?;
        for entry in store.entries.values() {
            write!(f, "\n    {}", render_entry(entry))?;
        }
        f.write_str("\n}>")
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TheType {
        value: i32,
    }

    #[test]
    fn add_by_inferred_type() {
        let scope = Scope::new();
        scope.add(TheType { value: 1 }).unwrap();

        assert_eq!(scope.get::<TheType>().unwrap().value, 1);
        assert_eq!(
            scope.to_string(),
            "<Scope: {\n    TheType: <TheType>\n}>"
        );
    }

    #[test]
    fn dual_keys_reach_the_same_resource() {
        let scope = Scope::new();
        scope.add_labelled("it", TheType { value: 2 }).unwrap();

        assert_eq!(scope.get::<TheType>().unwrap().value, 2);
        assert_eq!(scope.get_labelled::<TheType>("it").unwrap().value, 2);
    }

    #[test]
    fn label_only_registration_is_invisible_to_type_lookup() {
        let scope = Scope::new();
        scope.add_label_only("it", TheType { value: 3 }).unwrap();

        assert!(scope.get::<TheType>().is_none());
        assert_eq!(scope.get_labelled::<TheType>("it").unwrap().value, 3);
    }

    #[test]
    fn clash_on_type_key_names_the_type() {
        let scope = Scope::new();
        scope.add(TheType { value: 1 }).unwrap();

        let err = scope.add(TheType { value: 2 }).unwrap_err();
        assert_eq!(err.to_string(), "scope already contains TheType");
    }

    #[test]
    fn clash_on_label_names_the_label() {
        let scope = Scope::new();
        scope.add_label_only("it", TheType { value: 1 }).unwrap();

        let err = scope
            .add_labelled("it", String::from("other"))
            .unwrap_err();
        assert_eq!(err.to_string(), "scope already contains 'it'");
    }

    #[test]
    fn failed_add_registers_nothing() {
        let scope = Scope::new();
        scope.add(TheType { value: 1 }).unwrap();

        // Label is fresh but the type clashes, so the label must not be
        // indexed either.
        scope.add_labelled("it", TheType { value: 2 }).unwrap_err();
        assert!(!scope.contains_labelled("it"));
    }

    #[test]
    fn removal_through_either_key_removes_both() {
        let scope = Scope::new();
        scope.add_labelled("it", TheType { value: 1 }).unwrap();
        scope.remove::<TheType>().unwrap();
        assert!(scope.get::<TheType>().is_none());
        assert!(scope.get_labelled::<TheType>("it").is_none());

        scope.add_labelled("it", TheType { value: 2 }).unwrap();
        scope.remove_labelled("it").unwrap();
        assert!(scope.get::<TheType>().is_none());
        assert!(scope.get_labelled::<TheType>("it").is_none());
    }

    #[test]
    fn strict_remove_of_missing_key_fails() {
        let scope = Scope::new();
        let err = scope.remove::<TheType>().unwrap_err();
        assert_eq!(err.to_string(), "no TheType in scope");
        assert!(!scope.discard::<TheType>());
    }

    #[test]
    fn child_sees_parent_resources() {
        let scope = Scope::new();
        scope.add(TheType { value: 1 }).unwrap();

        let child = scope.nest();
        assert_eq!(child.get::<TheType>().unwrap().value, 1);
    }

    #[test]
    fn child_addition_is_invisible_to_parent() {
        let scope = Scope::new();
        let child = scope.nest();
        child.add(TheType { value: 1 }).unwrap();

        assert!(scope.get::<TheType>().is_none());
        assert_eq!(child.get::<TheType>().unwrap().value, 1);
    }

    #[test]
    fn child_shadows_parent_without_clashing() {
        let scope = Scope::new();
        scope.add(TheType { value: 1 }).unwrap();

        let child = scope.nest();
        child.add(TheType { value: 2 }).unwrap();

        assert_eq!(child.get::<TheType>().unwrap().value, 2);
        assert_eq!(scope.get::<TheType>().unwrap().value, 1);
    }

    #[test]
    fn resolver_is_invoked_on_every_get() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let scope = Scope::new();
        scope
            .add_resolver(move |_ctx| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                Some(TheType { value: n as i32 })
            })
            .unwrap();

        assert_eq!(scope.get::<TheType>().unwrap().value, 0);
        assert_eq!(scope.get::<TheType>().unwrap().value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn resolver_can_read_the_calling_scope() {
        let scope = Scope::new();
        scope.add(41_i32).unwrap();
        scope
            .add_resolver(|ctx: ProviderCtx| {
                ctx.scope().get::<i32>().map(|n| TheType { value: *n + 1 })
            })
            .unwrap();

        assert_eq!(scope.get::<TheType>().unwrap().value, 42);
    }

    #[test]
    fn suspending_resolver_errors_from_try_get_and_hides_from_get() {
        let scope = Scope::new();
        scope
            .add_async_resolver(|_ctx| async { Some(TheType { value: 1 }) })
            .unwrap();

        assert!(matches!(
            scope.try_get::<TheType>(),
            Err(Error::Suspending { .. })
        ));
        assert!(scope.get::<TheType>().is_none());
    }

    #[test]
    fn display_lists_entries_in_insertion_order() {
        let scope = Scope::new();
        scope.add_label_only("greeting", String::from("hi")).unwrap();
        scope.add(TheType { value: 1 }).unwrap();
        scope.add_labelled_resolver("answer", |_ctx| Some(42_i64)).unwrap();

        assert_eq!(
            scope.to_string(),
            "<Scope: {\n    'greeting': <String>\n    TheType: <TheType>\n    i64 @ 'answer': <provider>\n}>"
        );
    }

    #[test]
    fn labelled_lookup_with_wrong_type_is_missing() {
        let scope = Scope::new();
        scope.add_labelled("it", TheType { value: 1 }).unwrap();
        assert!(scope.get_labelled::<String>("it").is_none());
    }
}
