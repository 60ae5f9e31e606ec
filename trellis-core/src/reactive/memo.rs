//! Derived Values
//!
//! A derived value is a reaction that is itself readable as a property on
//! some registry. It caches the reader's result and recomputes it when a
//! dependency changes.
//!
//! # States
//!
//! ```text
//! Uncomputed -> Clean -> Dirty -> Recomputing -> Clean -> ...
//! ```
//!
//! 1. The first read executes the reader and caches the result.
//!
//! 2. When a dependency's flush notifies the derived value it becomes
//!    dirty. Outside a transaction it recomputes right away; inside one it
//!    stays dirty until read.
//!
//! 3. A recompute re-runs the reader through the executor and compares the
//!    new result to the cache with the runtime's structural comparator. Only
//!    an actual difference is reported on the owning registry, which
//!    cascades to whatever reads the derived property.
//!    Outside a transaction the owning registry is flushed right away, so
//!    readers see the new value in the same cycle as the write.
//!
//! # Fresh reads
//!
//! Reading a clean derived value outside a transaction first flushes any
//! dependency registry holding a pending change to a property the reader
//! used. Inside a transaction nothing may flush, so a read there recomputes
//! directly if a dependency has been written since the last computation.
//!
//! A failing reader leaves the cache untouched; the next read retries.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::trace;

use super::registry::{Registry, RegistryId};
use super::subscriber::{ReactionId, ReactionKind, RunFn, StaleFn, SubscriberFn};
use crate::error::{ReactiveError, Result};
use crate::value::Value;

/// Lifecycle state of a derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedState {
    /// Never read.
    Uncomputed,
    /// The cache is up to date.
    Clean,
    /// A dependency changed since the cache was filled.
    Dirty,
    /// The reader is running.
    Recomputing,
}

/// Write-through callback for a derived property.
pub type SetterFn = Rc<dyn Fn(Value) -> Result<()>>;

struct DerivedInner {
    registry: Registry,
    property: String,
    reaction: ReactionId,
    state: Cell<DerivedState>,
    /// Set when a notification was dropped while the reader ran.
    stale: Cell<bool>,
    cache: RefCell<Option<Value>>,
    /// Write clock at the last successful computation.
    computed_at: Cell<u64>,
    computations: Cell<usize>,
    setter: Option<SetterFn>,
    last_written: RefCell<Option<Value>>,
}

/// A cached, lazily recomputed property.
///
/// Clones share the same cache and reaction.
#[derive(Clone)]
pub struct DerivedValue {
    inner: Rc<DerivedInner>,
}

impl DerivedValue {
    /// Bind `reader` to `property` on `registry`.
    pub fn new<F>(registry: &Registry, property: impl Into<String>, reader: F) -> Self
    where
        F: Fn() -> Result<Value> + 'static,
    {
        Self::build(registry, property.into(), Rc::new(reader), None)
    }

    /// Like [`DerivedValue::new`], with a setter that makes the property
    /// writable.
    pub fn with_setter<F, S>(
        registry: &Registry,
        property: impl Into<String>,
        reader: F,
        setter: S,
    ) -> Self
    where
        F: Fn() -> Result<Value> + 'static,
        S: Fn(Value) -> Result<()> + 'static,
    {
        Self::build(registry, property.into(), Rc::new(reader), Some(Rc::new(setter)))
    }

    fn build(registry: &Registry, property: String, reader: RunFn, setter: Option<SetterFn>) -> Self {
        let runtime = registry.runtime().clone();
        let label = format!("{}.{}", registry.owner(), property);

        let inner = Rc::new_cyclic(|weak: &Weak<DerivedInner>| {
            let on_change = weak.clone();
            let subscriber: SubscriberFn = Rc::new(move |_| match on_change.upgrade() {
                Some(inner) => DerivedValue { inner }.invalidate(),
                None => Ok(()),
            });

            let on_drop = weak.clone();
            let on_stale: StaleFn = Rc::new(move || {
                if let Some(inner) = on_drop.upgrade() {
                    DerivedValue { inner }.mark_stale();
                }
            });

            let reaction = runtime.insert_reaction(
                label,
                ReactionKind::Derived,
                reader,
                subscriber,
                Some(on_stale),
            );

            DerivedInner {
                registry: registry.clone(),
                property,
                reaction,
                state: Cell::new(DerivedState::Uncomputed),
                stale: Cell::new(false),
                cache: RefCell::new(None),
                computed_at: Cell::new(0),
                computations: Cell::new(0),
                setter,
                last_written: RefCell::new(None),
            }
        });

        Self { inner }
    }

    pub fn reaction(&self) -> ReactionId {
        self.inner.reaction
    }

    pub fn property(&self) -> &str {
        &self.inner.property
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn state(&self) -> DerivedState {
        self.inner.state.get()
    }

    /// How many times the reader completed.
    pub fn compute_count(&self) -> usize {
        self.inner.computations.get()
    }

    pub fn has_setter(&self) -> bool {
        self.inner.setter.is_some()
    }

    /// The cached value, without recomputing or tracking.
    pub fn cached(&self) -> Option<Value> {
        self.inner.cache.borrow().clone()
    }

    /// Read the value, recomputing if needed, and record the read against
    /// the running reaction.
    pub fn get(&self) -> Result<Value> {
        self.ensure_fresh()?;
        let runtime = self.inner.registry.runtime();
        runtime.report(&self.inner.registry, &self.inner.property, false);
        Ok(self.cached().unwrap_or_default())
    }

    /// Read the value without recording a dependency. The reader's own
    /// dependencies are still tracked.
    pub fn get_untracked(&self) -> Result<Value> {
        self.ensure_fresh()?;
        Ok(self.cached().unwrap_or_default())
    }

    /// Write through the paired setter.
    ///
    /// The setter always runs; the property is reported only if `value`
    /// differs from the previous setter argument.
    pub fn set(&self, value: Value) -> Result<()> {
        let Some(setter) = &self.inner.setter else {
            return Err(ReactiveError::ReadOnly {
                owner: self.inner.registry.owner().to_string(),
                property: self.inner.property.clone(),
            });
        };

        setter(value.clone())?;

        let runtime = self.inner.registry.runtime();
        let previous = self.inner.last_written.replace(Some(value.clone()));
        let changed = match &previous {
            Some(previous) => !runtime.comparator().equals(previous, &value),
            None => true,
        };
        if changed {
            runtime.report(&self.inner.registry, &self.inner.property, true);
            self.inner.registry.report(&self.inner.property, &value);
        }
        Ok(())
    }

    /// Dispose the underlying reaction. The cache stays readable.
    pub fn dispose(&self) -> bool {
        self.inner.registry.runtime().dispose(self.inner.reaction)
    }

    fn ensure_fresh(&self) -> Result<()> {
        let runtime = self.inner.registry.runtime();

        if runtime.in_action() {
            // Deferred-compute path: nothing flushes until the transaction ends.
            if self.state() != DerivedState::Clean || self.written_since_compute() {
                self.recompute()?;
            }
            return Ok(());
        }

        if self.state() == DerivedState::Clean {
            for registry in self.pending_dependencies() {
                registry.batch()?;
            }
        }
        if self.state() != DerivedState::Clean {
            self.recompute()?;
        }
        Ok(())
    }

    /// Subscriber: a dependency changed.
    ///
    /// Outside a transaction a changed result is flushed from the owning
    /// registry right away, inside the same cycle as the write that caused
    /// it.
    fn invalidate(&self) -> Result<()> {
        let runtime = self.inner.registry.runtime();
        match self.state() {
            DerivedState::Uncomputed => return Ok(()),
            // A read already recomputed it after the write being flushed.
            DerivedState::Clean if self.inner.computed_at.get() >= runtime.write_clock() => {
                trace!(property = %self.inner.property, "already fresh");
                return Ok(());
            }
            _ => {}
        }
        self.inner.state.set(DerivedState::Dirty);

        if runtime.in_action() {
            trace!(property = %self.inner.property, "recompute deferred to next read");
            return Ok(());
        }
        if self.recompute()? {
            self.inner.registry.batch()?;
        }
        Ok(())
    }

    /// Stale hook: a notification was dropped (dedup, or the reader was
    /// running).
    fn mark_stale(&self) {
        match self.state() {
            DerivedState::Uncomputed => {}
            DerivedState::Recomputing => self.inner.stale.set(true),
            DerivedState::Clean | DerivedState::Dirty => {
                self.inner.state.set(DerivedState::Dirty)
            }
        }
    }

    /// Re-run the reader. Returns whether the result differs from the
    /// previous cache.
    fn recompute(&self) -> Result<bool> {
        let runtime = self.inner.registry.runtime();
        let previous_state = self.state();

        self.inner.stale.set(false);
        self.inner.state.set(DerivedState::Recomputing);

        let execution = match runtime.execute(self.inner.reaction) {
            Ok(execution) => execution,
            Err(err) => {
                self.inner.state.set(match previous_state {
                    DerivedState::Uncomputed => DerivedState::Uncomputed,
                    _ => DerivedState::Dirty,
                });
                return Err(err);
            }
        };

        let value = execution.value;
        self.inner.computations.set(self.inner.computations.get() + 1);
        let previous = self.inner.cache.replace(Some(value.clone()));
        self.inner.state.set(if self.inner.stale.replace(false) {
            DerivedState::Dirty
        } else {
            DerivedState::Clean
        });

        let changed = previous.is_some_and(|previous| !runtime.comparator().equals(&previous, &value));
        trace!(property = %self.inner.property, changed, "recomputed");
        if changed {
            self.inner.registry.report(&self.inner.property, &value);
        }
        self.inner.computed_at.set(runtime.write_clock());
        Ok(changed)
    }

    /// Whether anything this value read has a pending write newer than the
    /// cache.
    fn written_since_compute(&self) -> bool {
        let runtime = self.inner.registry.runtime();
        runtime.write_clock() > self.inner.computed_at.get() && !self.pending_dependencies().is_empty()
    }

    /// Dependency registries holding a pending change to a property this
    /// value read.
    fn pending_dependencies(&self) -> Vec<Registry> {
        let runtime = self.inner.registry.runtime();
        let mut registries: IndexMap<RegistryId, Registry> = IndexMap::new();
        for (registry, property) in runtime.edge_targets(self.inner.reaction) {
            if registry.has_pending(&property) {
                registries.entry(registry.id()).or_insert(registry);
            }
        }
        registries.into_values().collect()
    }
}

impl std::fmt::Debug for DerivedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedValue")
            .field("owner", &self.inner.registry.owner())
            .field("property", &self.inner.property)
            .field("state", &self.state())
            .field("compute_count", &self.compute_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
