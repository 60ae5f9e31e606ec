//! Reactive Runtime
//!
//! The runtime is the scheduler instance every registry and reaction of one
//! reactive world shares. It owns:
//!
//! - the reaction arena (see [`ReactionId`])
//! - the executor stack of currently running reactions
//! - the transaction depth and the pending-registry queue
//! - the notifier's per-cycle "already notified" set
//! - the deferred-callback queue
//!
//! # Cycles
//!
//! There is no ambient event loop. Work that must happen "after the current
//! synchronous execution" (flushing a registry outside a transaction,
//! clearing the notified set) is pushed onto the deferred queue, and the
//! host drains it with [`Runtime::run_until_idle`]. One drain of whatever
//! was queued is one scheduling cycle.
//!
//! # Threading
//!
//! A runtime is single-threaded (`Rc`/`RefCell` inside, so it is neither
//! `Send` nor `Sync`). Correctness rests on run-to-completion: a deferred
//! callback never interleaves with a running reaction.
//!
//! # Teardown
//!
//! Reaction closures usually capture the objects they read, and those
//! objects hold the runtime. Call [`Runtime::teardown`] (or dispose every
//! reaction) to break those cycles when the reactive world is discarded.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use super::context::{Execution, Executor};
use super::notifier::Notifier;
use super::subscriber::{
    ReactionArena, ReactionId, ReactionKind, ReactionNode, RunFn, StaleFn, SubscriberFn, Trigger,
};
use super::transaction::ActionState;
use crate::config::RuntimeConfig;
use crate::equality::Comparator;
use crate::error::{ReactiveError, Result};
use crate::value::Value;

/// A callback queued for the next cycle.
pub(crate) type Task = Box<dyn FnOnce(&Runtime) -> Result<()>>;

pub(crate) struct RuntimeInner {
    pub config: RuntimeConfig,
    pub comparator: Comparator,
    pub reactions: RefCell<ReactionArena>,
    pub executor: Executor,
    pub notifier: Notifier,
    pub actions: ActionState,
    deferred: RefCell<VecDeque<Task>>,
    flush_generation: Cell<u64>,
    write_clock: Cell<u64>,
    /// Bumped whenever the deferred queue is discarded.
    queue_epoch: Cell<u64>,
}

/// Handle to a reactive runtime. Clones share the same state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        debug!(name = %config.name, "runtime init");
        Self {
            inner: Rc::new(RuntimeInner {
                comparator: Comparator::new(config.compare_depth),
                config,
                reactions: RefCell::new(ReactionArena::default()),
                executor: Executor::default(),
                notifier: Notifier::default(),
                actions: ActionState::default(),
                deferred: RefCell::new(VecDeque::new()),
                flush_generation: Cell::new(0),
                write_clock: Cell::new(0),
                queue_epoch: Cell::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The structural comparator shared by every derived value.
    pub fn comparator(&self) -> &Comparator {
        &self.inner.comparator
    }

    /// Register a reaction without running it.
    ///
    /// `run` is what [`Runtime::execute`] calls; `subscriber` is invoked
    /// (at most once per cycle) when something `run` read has changed.
    pub fn create_reaction<R, S>(
        &self,
        label: impl Into<String>,
        kind: ReactionKind,
        run: R,
        subscriber: S,
    ) -> ReactionId
    where
        R: Fn() -> Result<Value> + 'static,
        S: Fn(&Trigger<'_>) -> Result<()> + 'static,
    {
        self.insert_reaction(label.into(), kind, Rc::new(run), Rc::new(subscriber), None)
    }

    pub(crate) fn insert_reaction(
        &self,
        label: String,
        kind: ReactionKind,
        run: RunFn,
        subscriber: SubscriberFn,
        on_stale: Option<StaleFn>,
    ) -> ReactionId {
        let id = self.inner.reactions.borrow_mut().insert(ReactionNode {
            label,
            kind,
            active: false,
            run,
            subscriber,
            on_stale,
            edges: SmallVec::new(),
        });
        debug!(reaction = %id, ?kind, "reaction created");
        id
    }

    /// Create a reaction, execute it once, and hand back the result with a
    /// subscription that disposes the reaction when dropped.
    pub fn track<R, S>(
        &self,
        label: impl Into<String>,
        run: R,
        subscriber: S,
    ) -> Result<(Execution, Subscription)>
    where
        R: Fn() -> Result<Value> + 'static,
        S: Fn(&Trigger<'_>) -> Result<()> + 'static,
    {
        let id = self.create_reaction(label, ReactionKind::Tracker, run, subscriber);
        let subscription = Subscription {
            runtime: self.clone(),
            reaction: id,
        };
        let execution = self.execute(id)?;
        Ok((execution, subscription))
    }

    /// Number of live reactions.
    pub fn reaction_count(&self) -> usize {
        self.inner.reactions.borrow().len()
    }

    pub fn reaction_label(&self, id: ReactionId) -> Option<String> {
        self.inner
            .reactions
            .borrow()
            .get(id)
            .map(|node| node.label.clone())
    }

    pub fn is_disposed(&self, id: ReactionId) -> bool {
        self.inner.reactions.borrow().get(id).is_none()
    }

    pub fn is_active(&self, id: ReactionId) -> bool {
        self.inner
            .reactions
            .borrow()
            .get(id)
            .is_some_and(|node| node.active)
    }

    /// `(active, kind)` of a live reaction.
    pub(crate) fn reaction_status(&self, id: ReactionId) -> Option<(bool, ReactionKind)> {
        self.inner
            .reactions
            .borrow()
            .get(id)
            .map(|node| (node.active, node.kind))
    }

    /// Mark a reaction stale without notifying it. Only derived values
    /// react to this.
    pub(crate) fn mark_stale(&self, id: ReactionId) {
        let hook = self
            .inner
            .reactions
            .borrow()
            .get(id)
            .and_then(|node| node.on_stale.clone());
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Queue a callback for after the current synchronous execution.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce(&Runtime) -> Result<()> + 'static,
    {
        self.inner.deferred.borrow_mut().push_back(Box::new(task));
    }

    /// Number of queued deferred callbacks.
    pub fn pending_tasks(&self) -> usize {
        self.inner.deferred.borrow().len()
    }

    /// Run deferred callbacks in FIFO order until the queue is empty.
    ///
    /// Returns how many callbacks ran. An error from a callback stops the
    /// drain and is returned; callbacks behind it stay queued. Inside a
    /// transaction body nothing is drained.
    pub fn run_until_idle(&self) -> Result<usize> {
        if self.in_action() {
            return Ok(0);
        }

        let limit = self.inner.config.drain_limit;
        let mut ran = 0;
        loop {
            if let Some(limit) = limit {
                if ran >= limit && self.pending_tasks() > 0 {
                    warn!(name = %self.inner.config.name, limit, "drain limit reached");
                    return Err(ReactiveError::DrainLimit { limit });
                }
            }

            let task = self.inner.deferred.borrow_mut().pop_front();
            let Some(task) = task else {
                break;
            };
            ran += 1;
            task(self)?;
        }

        if ran > 0 {
            debug!(name = %self.inner.config.name, ran, "idle");
        }
        Ok(ran)
    }

    pub(crate) fn next_flush_generation(&self) -> u64 {
        let generation = self.inner.flush_generation.get() + 1;
        self.inner.flush_generation.set(generation);
        generation
    }

    /// Number of registry flushes performed so far.
    pub fn flush_generation(&self) -> u64 {
        self.inner.flush_generation.get()
    }

    pub(crate) fn bump_write_clock(&self) {
        self.inner.write_clock.set(self.inner.write_clock.get() + 1);
    }

    /// Number of reports seen so far.
    pub(crate) fn write_clock(&self) -> u64 {
        self.inner.write_clock.get()
    }

    pub(crate) fn queue_epoch(&self) -> u64 {
        self.inner.queue_epoch.get()
    }

    /// Dispose every reaction and drop every queued callback.
    ///
    /// Registries stay usable: a later write schedules a fresh flush.
    pub fn teardown(&self) {
        let ids = self.inner.reactions.borrow().ids();
        let count = ids.len();
        for id in ids {
            self.dispose(id);
        }
        self.inner.deferred.borrow_mut().clear();
        self.inner.queue_epoch.set(self.inner.queue_epoch.get() + 1);
        self.inner.actions.clear();
        self.clear_notified();
        debug!(name = %self.inner.config.name, reactions = count, "runtime teardown");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.inner.config.name)
            .field("reactions", &self.reaction_count())
            .field("pending_tasks", &self.pending_tasks())
            .field("action_depth", &self.action_depth())
            .finish()
    }
}

/// Handle to a tracked reaction.
///
/// Dropping this handle disposes the reaction.
pub struct Subscription {
    runtime: Runtime,
    reaction: ReactionId,
}

impl Subscription {
    pub fn reaction(&self) -> ReactionId {
        self.reaction
    }

    pub fn is_disposed(&self) -> bool {
        self.runtime.is_disposed(self.reaction)
    }

    /// Dispose now rather than on drop.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.runtime.dispose(self.reaction);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Registry;

    #[test]
    fn deferred_callbacks_run_in_order() {
        let runtime = Runtime::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            runtime.defer(move |_| {
                order.borrow_mut().push(i);
                Ok(())
            });
        }

        assert_eq!(runtime.pending_tasks(), 3);
        assert_eq!(runtime.run_until_idle().unwrap(), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(runtime.pending_tasks(), 0);
    }

    #[test]
    fn callbacks_queued_while_draining_run_in_the_same_drain() {
        let runtime = Runtime::new();
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        runtime.defer(move |runtime| {
            runtime.defer(move |_| {
                flag.set(true);
                Ok(())
            });
            Ok(())
        });

        assert_eq!(runtime.run_until_idle().unwrap(), 2);
        assert!(ran.get());
    }

    #[test]
    fn failing_callback_stops_the_drain() {
        let runtime = Runtime::new();
        runtime.defer(|_| Err(ReactiveError::read("flush failed")));
        runtime.defer(|_| Ok(()));

        let err = runtime.run_until_idle().unwrap_err();
        assert!(matches!(err, ReactiveError::Read(_)));
        assert_eq!(runtime.pending_tasks(), 1);
        assert_eq!(runtime.run_until_idle().unwrap(), 1);
    }

    #[test]
    fn drain_limit_bounds_self_scheduling_work() {
        fn requeue(runtime: &Runtime) -> Result<()> {
            runtime.defer(requeue);
            Ok(())
        }

        let runtime = Runtime::with_config(RuntimeConfig::default().with_drain_limit(10));
        runtime.defer(requeue);

        let err = runtime.run_until_idle().unwrap_err();
        assert!(matches!(err, ReactiveError::DrainLimit { limit: 10 }));
    }

    #[test]
    fn subscription_disposes_on_drop() {
        let runtime = Runtime::new();
        let (execution, subscription) = runtime
            .track("answer", || Ok(Value::from(42)), |_| Ok(()))
            .unwrap();

        assert_eq!(execution.value.as_int(), Some(42));
        let id = subscription.reaction();
        assert!(!runtime.is_disposed(id));

        drop(subscription);
        assert!(runtime.is_disposed(id));
    }

    #[test]
    fn teardown_disposes_everything() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let id = runtime.create_reaction("r", ReactionKind::Tracker, || Ok(Value::Null), |_| Ok(()));
        registry.subscribe("a", id);
        registry.report("a", &Value::from(1));

        runtime.teardown();

        assert_eq!(runtime.reaction_count(), 0);
        assert_eq!(runtime.pending_tasks(), 0);
        assert_eq!(registry.subscriber_count("a"), 0);
    }

    #[test]
    fn registries_flush_again_after_teardown() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        registry.report("a", &Value::from(1));
        runtime.teardown();

        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let id = runtime.create_reaction(
            "r",
            ReactionKind::Tracker,
            || Ok(Value::Null),
            move |_| {
                seen.set(seen.get() + 1);
                Ok(())
            },
        );
        registry.subscribe("a", id);
        registry.report("a", &Value::from(2));

        assert_eq!(runtime.pending_tasks(), 1);
        runtime.run_until_idle().unwrap();
        assert_eq!(calls.get(), 1);
        assert!(!registry.is_dirty());
    }
}
