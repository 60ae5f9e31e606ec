//! Effect Implementation
//!
//! An Effect is a side-effecting reaction that re-runs whenever something it
//! read changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When a flush notifies the effect, it re-executes right away, inside
//!    the flush. The executor drops the old edges first and records new ones
//!    during the run, so dependencies follow the latest run only.
//!
//! 3. An effect writing a property it also reads does not trigger itself.
//!
//! # Differences from Derived Values
//!
//! - Derived values return a value; effects do not.
//! - Derived values are readable properties; effects are not read by anyone.
//! - Effects have no cache and no equality check.

use std::cell::Cell;
use std::rc::Rc;

use super::runtime::Runtime;
use super::subscriber::{ReactionId, ReactionKind};
use crate::error::Result;
use crate::value::Value;

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust
/// use trellis_core::{Effect, Runtime, Store};
///
/// let runtime = Runtime::new();
/// let count = Store::new(&runtime, "count");
///
/// let source = count.clone();
/// let effect = Effect::new(&runtime, move || {
///     println!("Count is: {}", source.get("value")?.as_int().unwrap_or(0));
///     Ok(())
/// })
/// .unwrap();
///
/// count.set("value", 5).unwrap();
/// runtime.run_until_idle().unwrap(); // Prints: "Count is: 5"
/// assert_eq!(effect.run_count(), 2);
/// ```
#[derive(Clone)]
pub struct Effect {
    runtime: Runtime,
    reaction: ReactionId,
    /// Completed runs, shared by clones.
    run_count: Rc<Cell<usize>>,
}

impl Effect {
    /// Create an effect and run it once.
    pub fn new<F>(runtime: &Runtime, run: F) -> Result<Self>
    where
        F: Fn() -> Result<()> + 'static,
    {
        let effect = Self::new_lazy(runtime, run);
        effect.execute()?;
        Ok(effect)
    }

    /// Create an effect without running it. It has no dependencies until
    /// [`Effect::execute`] is called.
    pub fn new_lazy<F>(runtime: &Runtime, run: F) -> Self
    where
        F: Fn() -> Result<()> + 'static,
    {
        let run_count = Rc::new(Cell::new(0));

        let counter = run_count.clone();
        let reaction = runtime.create_reaction(
            "effect",
            ReactionKind::Tracker,
            move || {
                run()?;
                counter.set(counter.get() + 1);
                Ok(Value::Null)
            },
            |trigger| trigger.runtime.execute(trigger.reaction).map(|_| ()),
        );

        Self {
            runtime: runtime.clone(),
            reaction,
            run_count,
        }
    }

    pub fn reaction(&self) -> ReactionId {
        self.reaction
    }

    /// Execute the effect function, re-tracking its dependencies.
    ///
    /// Does nothing once disposed.
    pub fn execute(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.runtime.execute(self.reaction).map(|_| ())
    }

    /// Dispose of the effect. After disposal it never runs again.
    pub fn dispose(&self) -> bool {
        self.runtime.dispose(self.reaction)
    }

    pub fn is_disposed(&self) -> bool {
        self.runtime.is_disposed(self.reaction)
    }

    /// Get the number of times the effect has run to completion.
    pub fn run_count(&self) -> usize {
        self.run_count.get()
    }

    /// Get the number of (registry, property) dependencies.
    pub fn dependency_count(&self) -> usize {
        self.runtime.edges_of(self.reaction).len()
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("reaction", &self.reaction)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
