//! Observable Stores
//!
//! A [`Store`] is a reactive object: a set of named slots plus the
//! [`Registry`] that tracks them. It is the explicit-wrapper form of
//! attribute interception: every `get` reports a read and every `set`
//! reports a write through the [`Interceptor`] capability, so reactions
//! reading a store are re-run when the slots they read change.
//!
//! # Slots
//!
//! - plain values
//! - nested stores: a map or record assigned to a property that is not
//!   marked shallow is wrapped into a child store with its own registry
//! - derived values bound to the property (see [`DerivedValue`])
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Effect, Runtime, Store, Value};
//!
//! let runtime = Runtime::new();
//! let counter = Store::new(&runtime, "counter");
//! counter.set("count", 1).unwrap();
//!
//! let source = counter.clone();
//! counter.derive("doubled", move || {
//!     Ok(Value::from(source.get("count")?.as_int().unwrap_or(0) * 2))
//! });
//!
//! let view = counter.clone();
//! let effect = Effect::new(&runtime, move || {
//!     view.get("doubled")?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! counter.set("count", 5).unwrap();
//! runtime.run_until_idle().unwrap();
//!
//! assert_eq!(counter.get("doubled").unwrap().as_int(), Some(10));
//! assert_eq!(effect.run_count(), 2);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use super::memo::DerivedValue;
use super::registry::{ListenerId, Registry};
use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};
use crate::value::Value;

/// The hooks an attribute-interception layer calls on every access.
pub trait Interceptor {
    /// A property was read.
    fn on_read(&self, property: &str);

    /// A property was written with `value`.
    fn on_write(&self, property: &str, value: &Value);
}

impl Interceptor for Registry {
    fn on_read(&self, property: &str) {
        self.runtime().report(self, property, false);
    }

    fn on_write(&self, property: &str, value: &Value) {
        self.runtime().report(self, property, true);
        self.report(property, value);
    }
}

#[derive(Clone)]
enum Slot {
    Value(Value),
    Object(Store),
    Derived(DerivedValue),
}

/// A reactive object.
///
/// Clones share the same slots and registry.
#[derive(Clone)]
pub struct Store {
    registry: Registry,
    slots: Rc<RefCell<IndexMap<String, Slot>>>,
    /// Set when the store wraps a record, so snapshots rebuild it.
    record: Option<Rc<str>>,
}

impl Store {
    /// Create an empty store with a plain registry.
    pub fn new(runtime: &Runtime, owner: impl Into<String>) -> Self {
        Self::with_registry(Registry::new(runtime, owner))
    }

    /// Create an empty store around a configured registry (ignored or
    /// shallow properties).
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            slots: Rc::new(RefCell::new(IndexMap::new())),
            record: None,
        }
    }

    /// Wrap a map or record, recursively wrapping nested objects. A
    /// wrapped record keeps its name.
    pub fn from_value(runtime: &Runtime, owner: impl Into<String>, value: Value) -> Result<Self> {
        let owner = owner.into();
        let Some(fields) = value.fields() else {
            return Err(ReactiveError::NotObservable {
                owner,
                property: String::new(),
            });
        };

        let record = match &value {
            Value::Record { name, .. } => Some(Rc::from(name.as_str())),
            _ => None,
        };
        let store = Store {
            record,
            ..Store::new(runtime, owner)
        };
        {
            let mut slots = store.slots.borrow_mut();
            for (property, field) in fields {
                let slot = store.wrap(property, field.clone())?;
                slots.insert(property.clone(), slot);
            }
        }
        Ok(store)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn owner(&self) -> &str {
        self.registry.owner()
    }

    pub fn runtime(&self) -> &Runtime {
        self.registry.runtime()
    }

    /// Name of the wrapped record, if the store wraps one.
    pub fn record_name(&self) -> Option<&str> {
        self.record.as_deref()
    }

    /// Tracked read. Missing properties read as `Null` (and are still
    /// tracked); nested stores read as a deep snapshot.
    pub fn get(&self, property: &str) -> Result<Value> {
        self.read(property, true)
    }

    /// Read without recording a dependency.
    pub fn get_untracked(&self, property: &str) -> Result<Value> {
        self.read(property, false)
    }

    /// Tracked read of a nested store.
    pub fn object(&self, property: &str) -> Result<Store> {
        self.registry.on_read(property);
        match self.slot(property) {
            Some(Slot::Object(child)) => Ok(child),
            _ => Err(ReactiveError::NotObservable {
                owner: self.owner().to_string(),
                property: property.to_string(),
            }),
        }
    }

    /// Write a property.
    ///
    /// Writing a structurally equal value is a no-op. Writing a derived
    /// property goes through its setter.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let comparator = *self.runtime().comparator();

        match self.slot(property) {
            Some(Slot::Derived(derived)) => return derived.set(value),
            Some(Slot::Value(old)) if comparator.equals(&old, &value) => return Ok(()),
            Some(Slot::Object(child)) if value.is_object() => {
                let current = child.snapshot_untracked()?;
                if comparator.equals(&current, &value) {
                    return Ok(());
                }
            }
            _ => {}
        }

        let slot = self.wrap(property, value.clone())?;
        self.slots.borrow_mut().insert(property.to_string(), slot);
        self.registry.on_write(property, &value);
        Ok(())
    }

    /// Replace a property with `f(current)`. The current value is read
    /// untracked.
    pub fn update<F>(&self, property: &str, f: F) -> Result<()>
    where
        F: FnOnce(&Value) -> Value,
    {
        let current = self.get_untracked(property)?;
        self.set(property, f(&current))
    }

    /// Delete a property. A derived property's reaction is disposed.
    /// Returns whether the property existed.
    pub fn remove(&self, property: &str) -> bool {
        let removed = self.slots.borrow_mut().shift_remove(property);
        match removed {
            Some(slot) => {
                if let Slot::Derived(derived) = slot {
                    derived.dispose();
                }
                self.registry.on_write(property, &Value::Null);
                true
            }
            None => false,
        }
    }

    /// Bind a derived value to `property`, replacing (and disposing) any
    /// previous derived value there.
    pub fn derive<F>(&self, property: &str, reader: F) -> DerivedValue
    where
        F: Fn() -> Result<Value> + 'static,
    {
        self.install(DerivedValue::new(&self.registry, property, reader))
    }

    /// Bind a writable derived value to `property`.
    pub fn derive_with_setter<F, S>(&self, property: &str, reader: F, setter: S) -> DerivedValue
    where
        F: Fn() -> Result<Value> + 'static,
        S: Fn(Value) -> Result<()> + 'static,
    {
        self.install(DerivedValue::with_setter(&self.registry, property, reader, setter))
    }

    /// Tracked deep read of every property.
    pub fn snapshot(&self) -> Result<Value> {
        self.snapshot_with(true)
    }

    pub fn snapshot_untracked(&self) -> Result<Value> {
        self.snapshot_with(false)
    }

    /// Property names in insertion order. Not tracked.
    pub fn keys(&self) -> Vec<String> {
        self.slots.borrow().keys().cloned().collect()
    }

    pub fn contains(&self, property: &str) -> bool {
        self.slots.borrow().contains_key(property)
    }

    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value) + 'static,
    {
        self.registry.listen(listener)
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.registry.unlisten(id)
    }

    fn slot(&self, property: &str) -> Option<Slot> {
        self.slots.borrow().get(property).cloned()
    }

    fn read(&self, property: &str, tracked: bool) -> Result<Value> {
        let slot = self.slot(property);
        if let Some(Slot::Derived(derived)) = &slot {
            return if tracked {
                derived.get()
            } else {
                derived.get_untracked()
            };
        }

        if tracked {
            self.registry.on_read(property);
        }
        match slot {
            Some(Slot::Value(value)) => Ok(value),
            Some(Slot::Object(child)) => child.snapshot_with(tracked),
            _ => Ok(Value::Null),
        }
    }

    fn snapshot_with(&self, tracked: bool) -> Result<Value> {
        let mut fields = IndexMap::new();
        for property in self.keys() {
            let value = self.read(&property, tracked)?;
            fields.insert(property, value);
        }
        Ok(match &self.record {
            Some(name) => Value::Record {
                name: name.to_string(),
                fields,
            },
            None => Value::Map(fields),
        })
    }

    fn wrap(&self, property: &str, value: Value) -> Result<Slot> {
        if value.is_object() && !self.registry.is_shallow(property) {
            let owner = format!("{}.{}", self.owner(), property);
            Ok(Slot::Object(Store::from_value(self.runtime(), owner, value)?))
        } else {
            Ok(Slot::Value(value))
        }
    }

    fn install(&self, derived: DerivedValue) -> DerivedValue {
        let previous = self
            .slots
            .borrow_mut()
            .insert(derived.property().to_string(), Slot::Derived(derived.clone()));
        if let Some(Slot::Derived(previous)) = previous {
            previous.dispose();
        }
        derived
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("owner", &self.owner())
            .field("keys", &self.keys())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn store_get_and_set() {
        let runtime = Runtime::new();
        let store = Store::new(&runtime, "obj");
        assert!(store.get("a").unwrap().is_null());

        store.set("a", 42).unwrap();
        assert_eq!(store.get("a").unwrap().as_int(), Some(42));
        assert_eq!(store.keys(), vec!["a"]);
    }

    #[test]
    fn store_update() {
        let runtime = Runtime::new();
        let store = Store::new(&runtime, "obj");
        store.set("a", 10).unwrap();
        store
            .update("a", |v| Value::from(v.as_int().unwrap_or(0) + 5))
            .unwrap();
        assert_eq!(store.get("a").unwrap().as_int(), Some(15));
    }

    #[test]
    fn equal_writes_are_not_reported() {
        let runtime = Runtime::new();
        let store = Store::new(&runtime, "obj");
        let reports = Rc::new(Cell::new(0));
        let seen = reports.clone();
        store.listen(move |_, _| seen.set(seen.get() + 1));

        store.set("a", 1).unwrap();
        store.set("a", 1).unwrap();
        store.set("a", 1.0).unwrap();
        assert_eq!(reports.get(), 1);
    }

    #[test]
    fn store_clone_shares_state() {
        let runtime = Runtime::new();
        let a = Store::new(&runtime, "obj");
        let b = a.clone();

        a.set("x", "hello").unwrap();
        assert_eq!(b.get("x").unwrap().as_str(), Some("hello"));
        assert_eq!(a.registry().id(), b.registry().id());
    }

    #[test]
    fn objects_are_wrapped_unless_shallow() {
        let runtime = Runtime::new();
        let registry = Registry::builder(&runtime, "root").shallow("raw").build();
        let store = Store::with_registry(registry);

        store.set("nested", Value::from(json!({ "n": 1 }))).unwrap();
        store.set("raw", Value::from(json!({ "n": 1 }))).unwrap();

        let child = store.object("nested").unwrap();
        assert_eq!(child.owner(), "root.nested");
        assert_eq!(child.get("n").unwrap().as_int(), Some(1));

        let err = store.object("raw").unwrap_err();
        assert!(matches!(err, ReactiveError::NotObservable { .. }));
        assert_eq!(store.get("raw").unwrap().to_json(), json!({ "n": 1 }));
    }

    #[test]
    fn from_value_rejects_primitives() {
        let runtime = Runtime::new();
        let err = Store::from_value(&runtime, "obj", Value::from(1)).unwrap_err();
        assert!(matches!(err, ReactiveError::NotObservable { .. }));
    }

    #[test]
    fn snapshot_reads_nested_stores() {
        let runtime = Runtime::new();
        let doc = json!({ "a": 1, "b": { "c": [1, 2], "d": "x" } });
        let store = Store::from_value(&runtime, "doc", Value::from(doc.clone())).unwrap();

        assert_eq!(store.snapshot().unwrap().to_json(), doc);
        assert_eq!(store.get("b").unwrap().to_json(), json!({ "c": [1, 2], "d": "x" }));
    }

    #[test]
    fn assigning_an_equal_object_keeps_the_child() {
        let runtime = Runtime::new();
        let store = Store::new(&runtime, "root");
        store.set("child", Value::from(json!({ "n": 1 }))).unwrap();
        let before = store.object("child").unwrap();

        store.set("child", Value::from(json!({ "n": 1 }))).unwrap();
        let after = store.object("child").unwrap();
        assert_eq!(before.registry().id(), after.registry().id());

        store.set("child", Value::from(json!({ "n": 2 }))).unwrap();
        let replaced = store.object("child").unwrap();
        assert_ne!(before.registry().id(), replaced.registry().id());
    }

    #[test]
    fn nested_records_keep_their_name() {
        let runtime = Runtime::new();
        let store = Store::new(&runtime, "root");
        let reports = Rc::new(Cell::new(0));
        let seen = reports.clone();
        store.listen(move |_, _| seen.set(seen.get() + 1));

        let point = || Value::record("Point", [("x", Value::from(1))]);
        store.set("p", point()).unwrap();
        let child = store.object("p").unwrap();
        assert_eq!(child.record_name(), Some("Point"));
        let read = store.get("p").unwrap();
        assert!(matches!(&read, Value::Record { name, .. } if name == "Point"));
        assert!(runtime.comparator().equals(&read, &point()));

        store.set("p", point()).unwrap();
        assert_eq!(reports.get(), 1);
        assert_eq!(store.object("p").unwrap().registry().id(), child.registry().id());

        // Same fields under another name is a different value.
        store
            .set("p", Value::record("Vector", [("x", Value::from(1))]))
            .unwrap();
        assert_eq!(reports.get(), 2);
        assert_eq!(store.object("p").unwrap().record_name(), Some("Vector"));
    }

    #[test]
    fn remove_reports_and_disposes_derived() {
        let runtime = Runtime::new();
        let store = Store::new(&runtime, "obj");
        let derived = store.derive("d", || Ok(Value::from(1)));
        store.get("d").unwrap();

        assert!(store.remove("d"));
        assert!(!store.remove("d"));
        assert!(runtime.is_disposed(derived.reaction()));
        assert!(store.get("d").unwrap().is_null());
        assert_eq!(store.registry().pending_changes(), vec!["d"]);
    }

    #[test]
    fn interceptor_on_write_reports_to_listeners() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let seen = Rc::new(RefCell::new(None));

        let sink = seen.clone();
        registry.listen(move |property, value| {
            *sink.borrow_mut() = Some((property.to_string(), value.as_int()));
        });
        registry.on_write("a", &Value::from(3));

        assert_eq!(*seen.borrow(), Some(("a".to_string(), Some(3))));
        assert!(registry.is_dirty());
    }
}
