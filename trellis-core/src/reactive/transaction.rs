//! Transactions.
//!
//! A transaction marks an action as in progress while its body runs. Every
//! registry written inside it joins a pending queue instead of scheduling
//! its own flush; when the outermost transaction ends, the queue is drained
//! once in insertion order and the notified set is cleared. A reaction
//! depending on several properties written in the same transaction is
//! therefore notified exactly once.
//!
//! Nested transactions run their body but leave all flushing to the outer
//! one.

use std::cell::{Cell, RefCell};
use std::rc::Weak;

use indexmap::IndexMap;
use tracing::debug;

use super::registry::{Registry, RegistryId, RegistryInner};
use super::runtime::Runtime;
use crate::error::Result;

#[derive(Default)]
pub(crate) struct ActionState {
    depth: Cell<usize>,
    pending: RefCell<IndexMap<RegistryId, Weak<RegistryInner>>>,
}

impl ActionState {
    pub fn clear(&self) {
        self.pending.borrow_mut().clear();
    }
}

/// Restores the action depth even if the body panics.
///
/// When the outermost body unwinds, its queued registries are handed to
/// the deferred queue so their writes still reach subscribers.
struct ActionGuard<'a> {
    runtime: &'a Runtime,
}

impl<'a> ActionGuard<'a> {
    fn enter(runtime: &'a Runtime) -> Self {
        let state = &runtime.inner.actions;
        state.depth.set(state.depth.get() + 1);
        Self { runtime }
    }
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        let state = &self.runtime.inner.actions;
        state.depth.set(state.depth.get() - 1);

        if state.depth.get() == 0 && std::thread::panicking() {
            let pending = std::mem::take(&mut *state.pending.borrow_mut());
            debug!(registries = pending.len(), "transaction unwound");
            for weak in pending.into_values() {
                if let Some(inner) = weak.upgrade() {
                    Registry::from_inner(inner).schedule_flush();
                }
            }
        }
    }
}

impl Runtime {
    /// Run `work` as one transaction and flush its writes once.
    ///
    /// Returns whatever `work` returned, or the first error raised while
    /// draining. If a registry's flush fails, the registries queued behind
    /// it are rescheduled as deferred flushes before the error is returned.
    ///
    /// ```rust
    /// use trellis_core::{Runtime, Store, Value};
    ///
    /// let runtime = Runtime::new();
    /// let point = Store::new(&runtime, "point");
    /// runtime
    ///     .transaction(|| {
    ///         point.set("x", 1)?;
    ///         point.set("y", 2)
    ///     })
    ///     .unwrap()
    ///     .unwrap();
    /// assert_eq!(point.get("y").unwrap().as_int(), Some(2));
    /// ```
    pub fn transaction<T>(&self, work: impl FnOnce() -> T) -> Result<T> {
        let result = {
            let _guard = ActionGuard::enter(self);
            work()
        };

        if !self.in_action() {
            self.drain_pending()?;
        }
        Ok(result)
    }

    /// Whether a transaction body is running.
    pub fn in_action(&self) -> bool {
        self.action_depth() > 0
    }

    pub fn action_depth(&self) -> usize {
        self.inner.actions.depth.get()
    }

    /// Number of registries waiting for the transaction to end.
    pub fn pending_registries(&self) -> usize {
        self.inner.actions.pending.borrow().len()
    }

    pub(crate) fn enqueue_pending(&self, registry: &Registry) {
        self.inner
            .actions
            .pending
            .borrow_mut()
            .entry(registry.id())
            .or_insert_with(|| registry.downgrade());
    }

    fn drain_pending(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.inner.actions.pending.borrow_mut());
        let queue: Vec<Weak<RegistryInner>> = pending.into_values().collect();
        if !queue.is_empty() {
            debug!(registries = queue.len(), "transaction drain");
        }

        for (index, weak) in queue.iter().enumerate() {
            let Some(inner) = weak.upgrade() else {
                continue;
            };
            if let Err(err) = Registry::from_inner(inner).batch() {
                for rest in &queue[index + 1..] {
                    if let Some(inner) = rest.upgrade() {
                        Registry::from_inner(inner).schedule_flush();
                    }
                }
                self.clear_notified();
                return Err(err);
            }
        }

        self.clear_notified();
        Ok(())
    }
}
