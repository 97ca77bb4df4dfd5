//! Critical-Section State Machine (C3): Ricart-Agrawala request/reply/
//! release logic, pending-reply tracking, deferred-reply queue and hold
//! timeout. `CsState` bundles every field that must move together under
//! one lock (state, clock, outstanding-request record, deferred queue)
//! so that a single `std::sync::Mutex<CsState>` is the whole lock:
//! holding its guard across an `.await` is a compile error, which rules
//! out suspending while holding it by construction.

use std::sync::Arc;

use indexmap::IndexSet;
use tokio::{sync::Notify, task::JoinHandle};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Released,
    Wanted,
    Held,
}

/// Everything guarded by `cs_mutex`: local clock, CS state, the
/// outstanding-request record (only meaningful while `state == Wanted`),
/// and the deferred-reply queue `D`.
pub struct CsState {
    pub(crate) state: State,
    pub(crate) clock: Clock,
    pub(crate) request_timestamp: Option<Clock>,
    pub(crate) expected_repliers: IndexSet<String>,
    pub(crate) received_replies: IndexSet<String>,
    /// Peers this process owes a REPLY to once it next releases. Insertion
    /// order is preserved but not semantically required; `IndexSet`
    /// guarantees the same peer is never queued twice.
    pub(crate) deferred: IndexSet<String>,
    /// Wakes the task blocked in `enter()` once `all_replies_received()`
    /// becomes true. Armed fresh on every `Released -> Wanted` transition.
    pub(crate) notify: Option<Arc<Notify>>,
    /// The hold-timeout timer (`MAX_ACCESS_TIME`) for the current hold, if
    /// any. Aborted on explicit `exit()` so a stale timer from a prior
    /// hold can never force-release a later one.
    pub(crate) hold_timer: Option<JoinHandle<()>>,
}

impl CsState {
    pub fn new() -> Self {
        Self {
            state: State::Released,
            clock: Clock::ZERO,
            request_timestamp: None,
            expected_repliers: IndexSet::new(),
            received_replies: IndexSet::new(),
            deferred: IndexSet::new(),
            notify: None,
            hold_timer: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// `received_replies ⊇ expected_repliers`, i.e. the "all replies
    /// received" completion condition (vacuously true with no active
    /// peers at request time).
    pub(crate) fn all_replies_received(&self) -> bool {
        self.expected_repliers.is_subset(&self.received_replies)
    }
}

impl Default for CsState {
    fn default() -> Self {
        Self::new()
    }
}
