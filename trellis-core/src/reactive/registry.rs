//! Per-object registries.
//!
//! Every reactive object owns exactly one [`Registry`]. It holds the
//! property → subscriber edges, the set of properties changed since the
//! last flush, the raw change listeners, and a dirty flag. The interception
//! layer (see [`Store`](super::Store)) funnels every read and write of the
//! object through it.
//!
//! # Flushing
//!
//! A write calls [`Registry::report`]. Inside a transaction the registry
//! joins the runtime's pending queue and is flushed once when the outer
//! transaction ends. Outside a transaction a deferred callback is queued,
//! at most once per registry per cycle. If [`Registry::batch`] already ran
//! synchronously in between (a derived value needing fresh state forces
//! it), the deferred callback finds the registry idle and does nothing.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use super::runtime::Runtime;
use super::subscriber::{Changes, ReactionId, ReactionKind};
use crate::error::Result;
use crate::value::Value;

/// Unique identifier for a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryId(u64);

impl RegistryId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifier returned by [`Registry::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Raw change callback, invoked synchronously on every report.
pub type ListenerFn = Rc<dyn Fn(&str, &Value)>;

/// Flush state of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing pending.
    Idle,
    /// Changes are pending a flush.
    Dirty,
}

pub(crate) struct RegistryInner {
    pub id: RegistryId,
    pub owner: String,
    pub runtime: Runtime,
    ignore: HashSet<String>,
    shallow: HashSet<String>,
    deps: RefCell<IndexMap<String, IndexSet<ReactionId>>>,
    listeners: RefCell<Vec<(ListenerId, ListenerFn)>>,
    pending: RefCell<IndexSet<String>>,
    state: Cell<FlushState>,
    /// Queue epoch of the deferred flush queued for this registry, if any.
    flush_scheduled: Cell<Option<u64>>,
}

/// Dependency bookkeeping for one reactive object.
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Rc<RegistryInner>,
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
    runtime: Runtime,
    owner: String,
    ignore: HashSet<String>,
    shallow: HashSet<String>,
}

impl RegistryBuilder {
    /// Never track this property.
    pub fn ignore(mut self, property: impl Into<String>) -> Self {
        self.ignore.insert(property.into());
        self
    }

    /// Do not wrap nested objects assigned to this property.
    pub fn shallow(mut self, property: impl Into<String>) -> Self {
        self.shallow.insert(property.into());
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            inner: Rc::new(RegistryInner {
                id: RegistryId::next(),
                owner: self.owner,
                runtime: self.runtime,
                ignore: self.ignore,
                shallow: self.shallow,
                deps: RefCell::new(IndexMap::new()),
                listeners: RefCell::new(Vec::new()),
                pending: RefCell::new(IndexSet::new()),
                state: Cell::new(FlushState::Idle),
                flush_scheduled: Cell::new(None),
            }),
        }
    }
}

impl Registry {
    /// Create a registry with no ignored or shallow properties.
    pub fn new(runtime: &Runtime, owner: impl Into<String>) -> Self {
        Self::builder(runtime, owner).build()
    }

    pub fn builder(runtime: &Runtime, owner: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder {
            runtime: runtime.clone(),
            owner: owner.into(),
            ignore: HashSet::new(),
            shallow: HashSet::new(),
        }
    }

    pub fn id(&self) -> RegistryId {
        self.inner.id
    }

    /// Diagnostic label of the owning object.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn ignores(&self, property: &str) -> bool {
        self.inner.ignore.contains(property)
    }

    pub fn is_shallow(&self, property: &str) -> bool {
        self.inner.shallow.contains(property)
    }

    pub fn state(&self) -> FlushState {
        self.inner.state.get()
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == FlushState::Dirty
    }

    pub fn has_pending(&self, property: &str) -> bool {
        self.inner.pending.borrow().contains(property)
    }

    /// Properties changed since the last flush, in write order.
    pub fn pending_changes(&self) -> Vec<String> {
        self.inner.pending.borrow().iter().cloned().collect()
    }

    /// Register `reaction` as a subscriber of `property`.
    ///
    /// No-op if the property is ignored or tracking is suspended. The edge
    /// is also recorded on the reaction, so disposing it removes the edge.
    pub fn subscribe(&self, property: &str, reaction: ReactionId) {
        self.inner.runtime.link(self, property, reaction);
    }

    /// Purge `reaction` from every property's subscriber set.
    pub fn remove_runnable(&self, reaction: ReactionId) {
        for subscribers in self.inner.deps.borrow_mut().values_mut() {
            subscribers.shift_remove(&reaction);
        }
        self.inner.runtime.forget_edges(reaction, self.id());
        trace!(owner = %self.inner.owner, %reaction, "removed runnable");
    }

    /// Current subscribers of `property`.
    pub fn subscribers(&self, property: &str) -> Vec<ReactionId> {
        self.inner
            .deps
            .borrow()
            .get(property)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, property: &str) -> usize {
        self.inner
            .deps
            .borrow()
            .get(property)
            .map_or(0, IndexSet::len)
    }

    /// Add a raw change listener. Listeners fire synchronously on every
    /// report, inside or outside a transaction.
    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Value) + 'static,
    {
        let id = ListenerId::next();
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Record a change to `property` and schedule a flush.
    pub fn report(&self, property: &str, value: &Value) {
        trace!(owner = %self.inner.owner, property, "report");

        self.inner.pending.borrow_mut().insert(property.to_string());
        self.inner.state.set(FlushState::Dirty);
        self.inner.runtime.bump_write_clock();

        let listeners: Vec<ListenerFn> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in listeners {
            listener(property, value);
        }

        self.schedule_flush();
    }

    /// Walk pending changes once and notify the subscribers of each changed
    /// property.
    ///
    /// Derived values are notified before trackers, so a reaction reading
    /// both a property and a value derived from it runs once, against the
    /// recomputed value. Active reactions are skipped; an active derived
    /// value is retried in a second pass after the walk and marked stale if
    /// it is still running. A failing subscriber does not stop the walk: the
    /// rest are still notified and the first error is returned at the end.
    ///
    /// Inside a transaction this only queues the registry.
    pub fn batch(&self) -> Result<()> {
        let runtime = &self.inner.runtime;

        if runtime.in_action() {
            if self.is_dirty() {
                runtime.enqueue_pending(self);
            }
            return Ok(());
        }

        if self.inner.state.get() != FlushState::Dirty {
            return Ok(());
        }
        self.inner.state.set(FlushState::Idle);

        let properties: Vec<String> = std::mem::take(&mut *self.inner.pending.borrow_mut())
            .into_iter()
            .collect();
        let generation = runtime.next_flush_generation();
        debug!(
            owner = %self.inner.owner,
            generation,
            changes = properties.len(),
            "flush"
        );

        let changes = Changes {
            registry: self.id(),
            owner: self.inner.owner.clone(),
            properties,
        };

        let mut derived: IndexSet<ReactionId> = IndexSet::new();
        let mut trackers: IndexSet<ReactionId> = IndexSet::new();
        for property in &changes.properties {
            for reaction in self.subscribers(property) {
                match runtime.reaction_status(reaction) {
                    None => self.remove_subscriber(property, reaction),
                    Some((_, ReactionKind::Derived)) => {
                        derived.insert(reaction);
                    }
                    Some((_, ReactionKind::Tracker)) => {
                        trackers.insert(reaction);
                    }
                }
            }
        }

        let mut first_error = None;
        let mut second_pass: IndexSet<ReactionId> = IndexSet::new();
        // Status is re-read per reaction: an earlier subscriber may have
        // disposed or started a later one.
        for reaction in derived.into_iter().chain(trackers) {
            match runtime.reaction_status(reaction) {
                Some((false, _)) => {
                    if let Err(err) = runtime.notify(reaction, &changes) {
                        first_error.get_or_insert(err);
                    }
                }
                Some((true, ReactionKind::Derived)) => {
                    second_pass.insert(reaction);
                }
                Some((true, ReactionKind::Tracker)) | None => {}
            }
        }

        for reaction in second_pass {
            match runtime.reaction_status(reaction) {
                Some((false, _)) => {
                    if let Err(err) = runtime.notify(reaction, &changes) {
                        first_error.get_or_insert(err);
                    }
                }
                Some((true, _)) => runtime.mark_stale(reaction),
                None => {}
            }
        }

        match first_error {
            Some(err) => {
                debug!(owner = %self.inner.owner, generation, error = %err, "flush failed");
                Err(err)
            }
            None => Ok(()),
        }
    }

    pub(crate) fn add_subscriber(&self, property: &str, reaction: ReactionId) -> bool {
        self.inner
            .deps
            .borrow_mut()
            .entry(property.to_string())
            .or_default()
            .insert(reaction)
    }

    pub(crate) fn remove_subscriber(&self, property: &str, reaction: ReactionId) {
        if let Some(subscribers) = self.inner.deps.borrow_mut().get_mut(property) {
            subscribers.shift_remove(&reaction);
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Rc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Queue a flush: onto the pending queue inside a transaction, as a
    /// deferred callback (once per cycle) otherwise.
    ///
    /// A callback dropped by [`Runtime::teardown`] no longer counts as
    /// queued, since teardown moves the runtime to a new queue epoch.
    pub(crate) fn schedule_flush(&self) {
        let runtime = &self.inner.runtime;
        if runtime.in_action() {
            runtime.enqueue_pending(self);
            return;
        }
        let epoch = runtime.queue_epoch();
        if self.inner.flush_scheduled.replace(Some(epoch)) == Some(epoch) {
            return;
        }

        let weak = self.downgrade();
        runtime.defer(move |_| match weak.upgrade() {
            Some(inner) => {
                inner.flush_scheduled.set(None);
                Registry::from_inner(inner).batch()
            }
            None => Ok(()),
        });
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("state", &self.state())
            .field("pending", &self.pending_changes())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_reaction(runtime: &Runtime, calls: Rc<Cell<usize>>) -> ReactionId {
        runtime.create_reaction(
            "counter",
            ReactionKind::Tracker,
            || Ok(Value::Null),
            move |_| {
                calls.set(calls.get() + 1);
                Ok(())
            },
        )
    }

    #[test]
    fn subscribe_never_duplicates_edges() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let reaction = counting_reaction(&runtime, Rc::default());

        registry.subscribe("a", reaction);
        registry.subscribe("a", reaction);

        assert_eq!(registry.subscribers("a"), vec![reaction]);
    }

    #[test]
    fn subscribe_skips_ignored_properties() {
        let runtime = Runtime::new();
        let registry = Registry::builder(&runtime, "obj").ignore("secret").build();
        let reaction = counting_reaction(&runtime, Rc::default());

        registry.subscribe("secret", reaction);
        assert_eq!(registry.subscriber_count("secret"), 0);
        assert!(registry.ignores("secret"));
    }

    #[test]
    fn report_marks_dirty_and_defers_one_flush() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");

        registry.report("a", &Value::from(1));
        registry.report("b", &Value::from(2));

        assert!(registry.is_dirty());
        assert_eq!(registry.pending_changes(), vec!["a", "b"]);
        assert_eq!(runtime.pending_tasks(), 1);

        runtime.run_until_idle().unwrap();
        assert!(!registry.is_dirty());
        assert!(registry.pending_changes().is_empty());
    }

    #[test]
    fn batch_notifies_each_subscriber_once() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let calls = Rc::new(Cell::new(0));
        let reaction = counting_reaction(&runtime, calls.clone());

        registry.subscribe("a", reaction);
        registry.subscribe("b", reaction);
        registry.report("a", &Value::from(1));
        registry.report("b", &Value::from(2));
        registry.batch().unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn deferred_flush_is_noop_after_synchronous_batch() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let calls = Rc::new(Cell::new(0));
        let reaction = counting_reaction(&runtime, calls.clone());

        registry.subscribe("a", reaction);
        registry.report("a", &Value::from(1));
        registry.batch().unwrap();
        assert_eq!(calls.get(), 1);

        runtime.run_until_idle().unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn listeners_fire_synchronously_in_write_order() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let sink = seen.clone();
        let id = registry.listen(move |property, value| {
            sink.borrow_mut()
                .push(format!("{}={}", property, value.as_int().unwrap_or(-1)));
        });

        registry.report("a", &Value::from(1));
        registry.report("b", &Value::from(2));
        assert_eq!(*seen.borrow(), vec!["a=1", "b=2"]);

        assert!(registry.unlisten(id));
        assert!(!registry.unlisten(id));
        registry.report("c", &Value::from(3));
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn remove_runnable_purges_every_property() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let calls = Rc::new(Cell::new(0));
        let reaction = counting_reaction(&runtime, calls.clone());

        registry.subscribe("a", reaction);
        registry.subscribe("b", reaction);
        registry.remove_runnable(reaction);

        assert_eq!(registry.subscriber_count("a"), 0);
        assert_eq!(registry.subscriber_count("b"), 0);

        registry.report("a", &Value::from(1));
        runtime.run_until_idle().unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn stale_subscribers_are_pruned_on_flush() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let reaction = counting_reaction(&runtime, Rc::default());

        registry.subscribe("a", reaction);
        // Free the slot without going through the registry.
        runtime.forget_reaction(reaction);

        registry.report("a", &Value::from(1));
        registry.batch().unwrap();
        assert_eq!(registry.subscriber_count("a"), 0);
    }
}
