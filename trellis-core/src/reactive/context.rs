//! Execution Context
//!
//! The executor tracks which reaction is currently running so reads can be
//! attributed to it automatically.
//!
//! # Implementation
//!
//! A LIFO stack of frames lives on the runtime. Executing a reaction pushes
//! a frame, drops the reaction's previous dependency edges, runs it, and
//! pops the frame. Every read reported while the stack is non-empty adds an
//! edge from `(registry, property)` to the top-of-stack reaction only, so
//! nested executions (a derived value read inside an effect) attribute
//! reads to the innermost reaction.
//!
//! A write reported while a reaction is running removes that reaction's
//! edge for the written property. A reaction that reads and then writes the
//! same property therefore does not re-trigger itself.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexSet;
use tracing::{debug, trace};

use super::registry::{Registry, RegistryId};
use super::runtime::Runtime;
use super::subscriber::{Edge, EdgeInfo, ReactionId};
use crate::error::{ReactiveError, Result};
use crate::value::Value;

/// One entry of the execution stack.
#[derive(Debug)]
struct Frame {
    reaction: ReactionId,
    /// Registries read during this execution, for diagnostics.
    read: IndexSet<RegistryId>,
}

#[derive(Default)]
pub(crate) struct Executor {
    stack: RefCell<Vec<Frame>>,
    suspended: Cell<usize>,
}

/// What one execution produced.
#[derive(Debug, Clone)]
pub struct Execution {
    pub value: Value,
    /// The reaction's dependency edges after this run.
    pub edges: Vec<EdgeInfo>,
    /// Registries read during this run, in first-read order.
    pub read_registries: Vec<RegistryId>,
}

/// Pops the frame and clears the active flag, even if `run()` panics.
struct ExecutionGuard<'a> {
    runtime: &'a Runtime,
    reaction: ReactionId,
    exited: bool,
}

impl<'a> ExecutionGuard<'a> {
    fn enter(runtime: &'a Runtime, reaction: ReactionId) -> Self {
        runtime.inner.executor.stack.borrow_mut().push(Frame {
            reaction,
            read: IndexSet::new(),
        });
        Self {
            runtime,
            reaction,
            exited: false,
        }
    }

    fn exit(mut self) -> Option<Frame> {
        self.exited = true;
        self.pop()
    }

    fn pop(&self) -> Option<Frame> {
        let popped = self.runtime.inner.executor.stack.borrow_mut().pop();
        if let Some(node) = self.runtime.inner.reactions.borrow_mut().get_mut(self.reaction) {
            node.active = false;
        }

        if let Some(frame) = &popped {
            debug_assert_eq!(
                frame.reaction, self.reaction,
                "execution stack mismatch: expected {}, got {}",
                self.reaction, frame.reaction
            );
        }
        popped
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if !self.exited {
            self.pop();
        }
    }
}

/// Restores the suspension depth on exit from [`Runtime::untracked`].
struct SuspendGuard<'a> {
    depth: &'a Cell<usize>,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

impl Runtime {
    /// Run a reaction, re-recording its dependencies.
    ///
    /// Errors from the reaction propagate unchanged; edges recorded before
    /// the failure are kept so a later change can retrigger it.
    pub fn execute(&self, reaction: ReactionId) -> Result<Execution> {
        let (run, old_edges) = {
            let mut arena = self.inner.reactions.borrow_mut();
            let node = arena
                .get_mut(reaction)
                .ok_or(ReactiveError::Disposed(reaction))?;
            if node.active {
                return Err(ReactiveError::Reentrant {
                    id: reaction,
                    label: node.label.clone(),
                });
            }
            node.active = true;
            debug!(%reaction, label = %node.label, "execute");
            (Rc::clone(&node.run), std::mem::take(&mut node.edges))
        };

        for edge in old_edges {
            if let Some(inner) = edge.registry.upgrade() {
                Registry::from_inner(inner).remove_subscriber(&edge.property, reaction);
            }
        }

        let guard = ExecutionGuard::enter(self, reaction);
        let result = run();
        let frame = guard.exit();

        let value = result?;
        Ok(Execution {
            value,
            edges: self.edges_of(reaction),
            read_registries: frame
                .map(|frame| frame.read.into_iter().collect())
                .unwrap_or_default(),
        })
    }

    /// Attribute an access of `(registry, property)` to the running
    /// reaction.
    ///
    /// Called by the interception layer on every read and write. No-op when
    /// nothing is running, tracking is suspended, or the property is
    /// ignored.
    pub fn report(&self, registry: &Registry, property: &str, is_write: bool) {
        if self.inner.executor.suspended.get() > 0 || registry.ignores(property) {
            return;
        }
        let Some(current) = self.current_reaction() else {
            return;
        };

        if is_write {
            registry.remove_subscriber(property, current);
            if let Some(node) = self.inner.reactions.borrow_mut().get_mut(current) {
                node.edges
                    .retain(|e| !(e.registry_id == registry.id() && e.property == property));
            }
            trace!(owner = registry.owner(), property, reaction = %current, "write unlinks");
        } else {
            self.link(registry, property, current);
            if let Some(frame) = self.inner.executor.stack.borrow_mut().last_mut() {
                frame.read.insert(registry.id());
            }
        }
    }

    /// Add the edge `(registry, property) -> reaction` on both sides.
    pub(crate) fn link(&self, registry: &Registry, property: &str, reaction: ReactionId) {
        if self.inner.executor.suspended.get() > 0 || registry.ignores(property) {
            return;
        }

        let mut arena = self.inner.reactions.borrow_mut();
        let Some(node) = arena.get_mut(reaction) else {
            return;
        };
        registry.add_subscriber(property, reaction);
        if !node.has_edge(registry.id(), property) {
            node.edges.push(Edge {
                registry: registry.downgrade(),
                registry_id: registry.id(),
                property: property.to_string(),
            });
            trace!(owner = registry.owner(), property, %reaction, "link");
        }
    }

    /// Drop the reaction-side edges that point at `registry`.
    pub(crate) fn forget_edges(&self, reaction: ReactionId, registry: RegistryId) {
        if let Some(node) = self.inner.reactions.borrow_mut().get_mut(reaction) {
            node.edges.retain(|e| e.registry_id != registry);
        }
    }

    /// Dispose a reaction: purge every edge it owns and free its slot.
    ///
    /// Returns `false` if it was already disposed.
    pub fn dispose(&self, reaction: ReactionId) -> bool {
        let node = self.inner.reactions.borrow_mut().remove(reaction);
        let Some(node) = node else {
            return false;
        };

        for edge in &node.edges {
            if let Some(inner) = edge.registry.upgrade() {
                Registry::from_inner(inner).remove_subscriber(&edge.property, reaction);
            }
        }
        debug!(%reaction, label = %node.label, edges = node.edges.len(), "dispose");
        true
    }

    /// Run `f` with dependency tracking suspended.
    pub fn untracked<T>(&self, f: impl FnOnce() -> T) -> T {
        let depth = &self.inner.executor.suspended;
        depth.set(depth.get() + 1);
        let _guard = SuspendGuard { depth };
        f()
    }

    /// The innermost running reaction.
    pub fn current_reaction(&self) -> Option<ReactionId> {
        self.inner
            .executor
            .stack
            .borrow()
            .last()
            .map(|frame| frame.reaction)
    }

    /// Whether a read right now would record a dependency.
    pub fn is_tracking(&self) -> bool {
        self.inner.executor.suspended.get() == 0 && self.current_reaction().is_some()
    }

    /// Current dependency edges of a reaction.
    pub fn edges_of(&self, reaction: ReactionId) -> Vec<EdgeInfo> {
        self.inner
            .reactions
            .borrow()
            .get(reaction)
            .map(|node| node.edges.iter().map(Edge::info).collect())
            .unwrap_or_default()
    }

    /// Live `(registry, property)` targets of a reaction's edges.
    pub(crate) fn edge_targets(&self, reaction: ReactionId) -> Vec<(Registry, String)> {
        self.inner
            .reactions
            .borrow()
            .get(reaction)
            .map(|node| {
                node.edges
                    .iter()
                    .filter_map(|e| {
                        e.registry
                            .upgrade()
                            .map(|inner| (Registry::from_inner(inner), e.property.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Free a slot without purging edges, leaving stale handles behind.
    #[cfg(test)]
    pub(crate) fn forget_reaction(&self, reaction: ReactionId) {
        self.inner.reactions.borrow_mut().remove(reaction);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ReactionKind;

    fn reader(runtime: &Runtime, registry: &Registry, properties: &'static [&'static str]) -> ReactionId {
        let rt = runtime.clone();
        let reg = registry.clone();
        runtime.create_reaction(
            "reader",
            ReactionKind::Tracker,
            move || {
                for property in properties {
                    rt.report(&reg, property, false);
                }
                Ok(Value::Null)
            },
            |_| Ok(()),
        )
    }

    #[test]
    fn execute_records_reads() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let id = reader(&runtime, &registry, &["a", "b"]);

        assert!(runtime.current_reaction().is_none());
        let execution = runtime.execute(id).unwrap();
        assert!(runtime.current_reaction().is_none());

        let properties: Vec<_> = execution.edges.iter().map(|e| e.property.as_str()).collect();
        assert_eq!(properties, vec!["a", "b"]);
        assert_eq!(execution.edges[0].owner, "obj");
        assert_eq!(execution.read_registries, vec![registry.id()]);
        assert_eq!(registry.subscribers("a"), vec![id]);
        assert!(!runtime.is_active(id));
    }

    #[test]
    fn re_execution_drops_old_edges() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let flip = Rc::new(Cell::new(true));

        let (rt, reg, toggle) = (runtime.clone(), registry.clone(), flip.clone());
        let id = runtime.create_reaction(
            "branch",
            ReactionKind::Tracker,
            move || {
                let property = if toggle.get() { "a" } else { "b" };
                rt.report(&reg, property, false);
                Ok(Value::Null)
            },
            |_| Ok(()),
        );

        runtime.execute(id).unwrap();
        assert_eq!(registry.subscriber_count("a"), 1);

        flip.set(false);
        runtime.execute(id).unwrap();
        assert_eq!(registry.subscriber_count("a"), 0);
        assert_eq!(registry.subscriber_count("b"), 1);
    }

    #[test]
    fn nested_reads_go_to_innermost_reaction() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let inner = reader(&runtime, &registry, &["inner"]);

        let (rt, reg) = (runtime.clone(), registry.clone());
        let outer = runtime.create_reaction(
            "outer",
            ReactionKind::Tracker,
            move || {
                rt.report(&reg, "before", false);
                rt.execute(inner)?;
                rt.report(&reg, "after", false);
                Ok(Value::Null)
            },
            |_| Ok(()),
        );

        runtime.execute(outer).unwrap();
        assert_eq!(registry.subscribers("before"), vec![outer]);
        assert_eq!(registry.subscribers("after"), vec![outer]);
        assert_eq!(registry.subscribers("inner"), vec![inner]);
    }

    #[test]
    fn write_removes_own_edge() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");

        let (rt, reg) = (runtime.clone(), registry.clone());
        let id = runtime.create_reaction(
            "read-then-write",
            ReactionKind::Tracker,
            move || {
                rt.report(&reg, "a", false);
                rt.report(&reg, "a", true);
                Ok(Value::Null)
            },
            |_| Ok(()),
        );

        let execution = runtime.execute(id).unwrap();
        assert!(execution.edges.is_empty());
        assert_eq!(registry.subscriber_count("a"), 0);
    }

    #[test]
    fn untracked_reads_record_nothing() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");

        let (rt, reg) = (runtime.clone(), registry.clone());
        let id = runtime.create_reaction(
            "untracked",
            ReactionKind::Tracker,
            move || {
                assert!(rt.is_tracking());
                rt.untracked(|| {
                    assert!(!rt.is_tracking());
                    rt.report(&reg, "a", false);
                });
                Ok(Value::Null)
            },
            |_| Ok(()),
        );

        runtime.execute(id).unwrap();
        assert_eq!(registry.subscriber_count("a"), 0);
    }

    #[test]
    fn reentrant_execution_fails() {
        let runtime = Runtime::new();
        let slot: Rc<Cell<Option<ReactionId>>> = Rc::default();

        let (rt, me) = (runtime.clone(), slot.clone());
        let id = runtime.create_reaction(
            "self",
            ReactionKind::Tracker,
            move || match me.get() {
                Some(id) => rt.execute(id).map(|e| e.value),
                None => Ok(Value::Null),
            },
            |_| Ok(()),
        );
        slot.set(Some(id));

        let err = runtime.execute(id).unwrap_err();
        assert!(matches!(err, ReactiveError::Reentrant { .. }));
        assert!(!runtime.is_active(id));
    }

    #[test]
    fn errors_propagate_and_clear_active_flag() {
        let runtime = Runtime::new();
        let id = runtime.create_reaction(
            "failing",
            ReactionKind::Tracker,
            || Err(ReactiveError::read("boom")),
            |_| Ok(()),
        );

        assert!(matches!(runtime.execute(id), Err(ReactiveError::Read(_))));
        assert!(!runtime.is_active(id));
        assert!(runtime.current_reaction().is_none());
    }

    #[test]
    fn dispose_purges_edges_and_is_idempotent() {
        let runtime = Runtime::new();
        let registry = Registry::new(&runtime, "obj");
        let id = reader(&runtime, &registry, &["a"]);

        runtime.execute(id).unwrap();
        assert!(runtime.dispose(id));
        assert!(!runtime.dispose(id));
        assert_eq!(registry.subscriber_count("a"), 0);
        assert!(matches!(runtime.execute(id), Err(ReactiveError::Disposed(_))));
    }
}
