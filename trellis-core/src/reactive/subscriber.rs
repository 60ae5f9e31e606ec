//! Reactions and the arena that owns them.
//!
//! A reaction is any re-runnable unit of work: an effect, a render
//! function bound by an adapter, or the reader behind a derived value.
//! Registries never hold reactions directly; they hold [`ReactionId`]
//! handles into the runtime's arena. A handle carries the generation of
//! the slot it was issued for, so once a reaction is disposed (and its
//! slot possibly reused) every stale handle resolves to nothing.

use std::fmt;
use std::rc::{Rc, Weak};

use slab::Slab;
use smallvec::SmallVec;

use super::registry::{RegistryId, RegistryInner};
use super::runtime::Runtime;
use crate::error::Result;
use crate::value::Value;

/// Stable handle to a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReactionId {
    index: usize,
    generation: u32,
}

impl fmt::Display for ReactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// What kind of reaction a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    /// A tracked function (effect, render binding, ad-hoc tracker).
    Tracker,
    /// The reader behind a derived value.
    Derived,
}

/// Snapshot of the properties that changed on one registry, handed to a
/// reaction's subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes {
    pub registry: RegistryId,
    pub owner: String,
    pub properties: Vec<String>,
}

impl Changes {
    pub fn contains(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }
}

/// Context passed to a subscriber when one of its reads changed.
pub struct Trigger<'a> {
    pub runtime: &'a Runtime,
    pub reaction: ReactionId,
    pub changes: &'a Changes,
}

pub type RunFn = Rc<dyn Fn() -> Result<Value>>;
pub type SubscriberFn = Rc<dyn Fn(&Trigger<'_>) -> Result<()>>;
pub type StaleFn = Rc<dyn Fn()>;

/// One dependency edge recorded on the reaction side, so it can be removed
/// from the registry again.
#[derive(Clone)]
pub(crate) struct Edge {
    pub registry: Weak<RegistryInner>,
    pub registry_id: RegistryId,
    pub property: String,
}

/// Public view of a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeInfo {
    pub registry: RegistryId,
    pub owner: String,
    pub property: String,
}

impl Edge {
    pub fn info(&self) -> EdgeInfo {
        let owner = self
            .registry
            .upgrade()
            .map(|inner| inner.owner.clone())
            .unwrap_or_default();
        EdgeInfo {
            registry: self.registry_id,
            owner,
            property: self.property.clone(),
        }
    }
}

/// Everything the runtime keeps about one reaction.
pub(crate) struct ReactionNode {
    pub label: String,
    pub kind: ReactionKind,
    pub active: bool,
    pub run: RunFn,
    pub subscriber: SubscriberFn,
    /// Marks a derived value stale when a notification for it is dropped.
    pub on_stale: Option<StaleFn>,
    /// The current execution result: edges recorded by the last run.
    pub edges: SmallVec<[Edge; 4]>,
}

impl ReactionNode {
    pub fn has_edge(&self, registry: RegistryId, property: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.registry_id == registry && e.property == property)
    }
}

/// Generational arena of reactions.
#[derive(Default)]
pub(crate) struct ReactionArena {
    slots: Slab<(u32, ReactionNode)>,
    generations: Vec<u32>,
}

impl ReactionArena {
    pub fn insert(&mut self, node: ReactionNode) -> ReactionId {
        let entry = self.slots.vacant_entry();
        let index = entry.key();
        if self.generations.len() <= index {
            self.generations.resize(index + 1, 0);
        }
        let generation = self.generations[index];
        entry.insert((generation, node));
        ReactionId { index, generation }
    }

    pub fn get(&self, id: ReactionId) -> Option<&ReactionNode> {
        match self.slots.get(id.index) {
            Some((generation, node)) if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ReactionId) -> Option<&mut ReactionNode> {
        match self.slots.get_mut(id.index) {
            Some((generation, node)) if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    /// Free the slot and bump its generation so old handles go stale.
    pub fn remove(&mut self, id: ReactionId) -> Option<ReactionNode> {
        self.get(id)?;
        let (_, node) = self.slots.remove(id.index);
        self.generations[id.index] = self.generations[id.index].wrapping_add(1);
        Some(node)
    }

    pub fn ids(&self) -> Vec<ReactionId> {
        self.slots
            .iter()
            .map(|(index, (generation, _))| ReactionId {
                index,
                generation: *generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
