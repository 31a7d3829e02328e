//! Supervisor lifecycle state machine.

use std::sync::{Mutex, PoisonError};

/// Lifecycle state of a supervised process.
///
/// States only move forward: `NotStarted → Starting → Running → Stopped →
/// Disposed`. `Starting` covers the window between control-thread launch and
/// child-handle publication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupervisorState {
    /// Constructed, `start` not yet called.
    #[default]
    NotStarted,
    /// Control thread launched, child handle not yet published.
    Starting,
    /// Child handle published; the child may be producing output.
    Running,
    /// The child has exited or was never created.
    Stopped,
    /// Torn down; only idempotent disposal is accepted.
    Disposed,
}

/// Shared, forward-only state holder.
///
/// Written by both the caller thread and the control thread; transitions that
/// would move backward are ignored so the two sides cannot race the machine
/// into an earlier state.
#[derive(Debug, Default)]
pub(super) struct StateCell {
    current: Mutex<SupervisorState>,
}

impl StateCell {
    pub(super) fn get(&self) -> SupervisorState {
        *self.lock()
    }

    /// Advance to `next` if it is ahead of the current state.
    pub(super) fn advance(&self, next: SupervisorState) {
        let mut current = self.lock();
        if next > *current {
            tracing::debug!(from = ?*current, to = ?next, "State transition");
            *current = next;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        // The cell holds a plain Copy value, so a poisoned lock is still usable.
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
