// Lamport logical clock (Commun. ACM'78, IR2) plus the peer-name tiebreak
// that turns (timestamp, name) into a total order suitable for
// Ricart-Agrawala priority comparisons.

use serde::{Deserialize, Serialize};

/// A Lamport timestamp. Wraps a plain counter, never decreases once
/// observed by `tick`/`merge`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Clock(u64);

impl Clock {
    pub const ZERO: Clock = Clock(0);

    /// Advances the clock by one and returns the new value.
    pub fn tick(&mut self) -> Clock {
        self.0 += 1;
        *self
    }

    /// Merges in a timestamp observed on an inbound message:
    /// `T <- max(T, t_r) + 1`.
    pub fn merge(&mut self, remote: Clock) {
        self.0 = self.0.max(remote.0) + 1;
    }

    /// Current value, for debugging only.
    pub fn now(&self) -> Clock {
        *self
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// `(timestamp, name)` total order used to break ties between concurrent
/// requests: smaller timestamp wins, and equal timestamps are won by the
/// lexicographically smaller name.
///
/// `local` has priority over `remote` (i.e. `local` must be served first)
/// when this returns `true`.
pub fn has_priority(local: Clock, local_name: &str, remote: Clock, remote_name: &str) -> bool {
    (local, local_name) < (remote, remote_name)
}
