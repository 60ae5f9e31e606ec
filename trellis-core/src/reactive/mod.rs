//! Reactive Primitives
//!
//! This module implements the dependency-tracking engine: registries,
//! reactions, derived values, effects and transactions. Together they make
//! plain property reads and writes reactive.
//!
//! # Concepts
//!
//! ## Registries
//!
//! A [`Registry`] is the per-object dependency record. It maps each
//! property name to the reactions that read it, collects the properties
//! written since the last flush, and notifies subscribers when it flushes.
//!
//! ## Reactions and the Executor
//!
//! A reaction is a re-runnable unit of work living in the runtime's arena.
//! While [`Runtime::execute`] runs one, every read reported through
//! [`Runtime::report`] becomes an edge from the read property to the
//! innermost running reaction. Re-executing drops the old edges first, so
//! a reaction only ever depends on what its latest run read.
//!
//! ## Stores
//!
//! A [`Store`] is a reactive object: it reports its own reads and writes
//! through the [`Interceptor`] capability, wraps nested objects into child
//! stores, and can bind derived values to properties.
//!
//! ## Derived Values
//!
//! A [`DerivedValue`] caches a reader's result as a property. It recomputes
//! when a dependency changes and only reports a change on its owning
//! registry when the new result is structurally different.
//!
//! ## Effects
//!
//! An [`Effect`] is a side-effecting reaction that re-runs whenever a
//! dependency changes.
//!
//! # Scheduling
//!
//! Writes outside a transaction queue one deferred flush per registry, run
//! by [`Runtime::run_until_idle`]. Writes inside [`Runtime::transaction`]
//! are flushed once, when the outermost transaction ends. Either way a
//! reaction is notified at most once per cycle.

mod context;
mod effect;
mod memo;
mod notifier;
mod registry;
mod runtime;
mod signal;
mod subscriber;
mod transaction;

pub use context::Execution;
pub use effect::Effect;
pub use memo::{DerivedState, DerivedValue, SetterFn};
pub use registry::{FlushState, ListenerFn, ListenerId, Registry, RegistryBuilder, RegistryId};
pub use runtime::{Runtime, Subscription};
pub use signal::{Interceptor, Store};
pub use subscriber::{Changes, EdgeInfo, ReactionId, ReactionKind, Trigger};
