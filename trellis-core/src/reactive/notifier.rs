//! Per-cycle notification dedup.
//!
//! A reaction receives at most one `subscriber()` call per scheduling cycle,
//! however many of its dependencies (on however many registries) changed.
//! The first notification of a cycle queues a deferred callback that clears
//! the notified set; a transaction clears it early when it finishes
//! draining.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;

use tracing::trace;

use super::runtime::Runtime;
use super::subscriber::{Changes, ReactionId, Trigger};
use crate::error::Result;

#[derive(Default)]
pub(crate) struct Notifier {
    notified: RefCell<HashSet<ReactionId>>,
    clear_scheduled: Cell<bool>,
    /// Bumped by every clear, so a queued clear from an earlier cycle does
    /// not wipe the current one.
    epoch: Cell<u64>,
}

impl Runtime {
    /// Invoke a reaction's subscriber unless it was already notified this
    /// cycle.
    ///
    /// A derived value that is skipped here is marked stale instead, so its
    /// next read recomputes.
    pub(crate) fn notify(&self, reaction: ReactionId, changes: &Changes) -> Result<()> {
        let notifier = &self.inner.notifier;

        if !notifier.notified.borrow_mut().insert(reaction) {
            trace!(%reaction, owner = %changes.owner, "already notified this cycle");
            self.mark_stale(reaction);
            return Ok(());
        }

        if !notifier.clear_scheduled.replace(true) {
            let epoch = notifier.epoch.get();
            self.defer(move |runtime| {
                if runtime.inner.notifier.epoch.get() == epoch {
                    runtime.clear_notified();
                }
                Ok(())
            });
        }

        // Checked right before the call: the reaction may have been disposed
        // earlier in this flush.
        let subscriber = match self.inner.reactions.borrow().get(reaction) {
            Some(node) => node.subscriber.clone(),
            None => return Ok(()),
        };

        trace!(%reaction, owner = %changes.owner, changes = ?changes.properties, "notify");
        subscriber(&Trigger {
            runtime: self,
            reaction,
            changes,
        })
    }

    /// Reset the notified set, starting a new cycle.
    pub fn clear_notified(&self) {
        let notifier = &self.inner.notifier;
        notifier.notified.borrow_mut().clear();
        notifier.clear_scheduled.set(false);
        notifier.epoch.set(notifier.epoch.get() + 1);
    }

    /// Whether `reaction` was notified in the current cycle.
    pub fn was_notified(&self, reaction: ReactionId) -> bool {
        self.inner.notifier.notified.borrow().contains(&reaction)
    }
}
