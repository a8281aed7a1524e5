use crate::scheduler::current::BlockedGuard;
use std::fmt::{Debug, Formatter};
use std::sync::{Condvar, Mutex, PoisonError};

struct BarrierState {
    enrolled: usize,
    arrived: usize,
    /// Bumped when a phase completes; waiters leave when it moves, so a
    /// late `synchronize` counts toward the next phase.
    generation: u64,
}

/// A cyclic synchronization point for a varying set of tasks.
///
/// Tasks [`enroll`] on the barrier, then [`synchronize`] any number of
/// times; each `synchronize` blocks until every enrolled task has
/// arrived, upon which the whole phase is released together. A task
/// leaves by calling [`resign`], which also releases a phase its
/// departure completes.
///
/// The barrier counts parties, it does not track identities: enrolling
/// twice, or resigning or synchronizing without a matching enroll, is a
/// programming error the barrier cannot detect (a task that leaves
/// without resigning blocks the others forever).
///
/// [`enroll`]: Barrier::enroll
/// [`synchronize`]: Barrier::synchronize
/// [`resign`]: Barrier::resign
pub struct Barrier {
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl Barrier {
    /// A barrier with no tasks enrolled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_enrolled(0)
    }

    /// A barrier with `enrolled` parties pre-enrolled; those parties
    /// must not call [`enroll`](Barrier::enroll) again.
    #[must_use]
    pub fn with_enrolled(enrolled: usize) -> Self {
        Barrier {
            state: Mutex::new(BarrierState {
                enrolled,
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Add the calling task to the parties a phase waits for.
    pub fn enroll(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.enrolled += 1;
    }

    /// Remove the calling task from the barrier. When the departure
    /// leaves every remaining party already arrived, the phase releases.
    ///
    /// # Panics
    /// if no task is enrolled.
    pub fn resign(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(state.enrolled > 0, "resign without a matching enroll");
        state.enrolled -= 1;
        if state.enrolled > 0 && state.arrived == state.enrolled {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
        }
    }

    /// Block until every enrolled task has called `synchronize`.
    pub fn synchronize(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.arrived += 1;
        if state.arrived == state.enrolled {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return;
        }
        let generation = state.generation;
        let _blocked = BlockedGuard::new();
        while state.generation == generation {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of currently enrolled tasks; may be stale on return.
    #[must_use]
    pub fn enrolled(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enrolled
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Barrier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Barrier")
            .field("enrolled", &state.enrolled)
            .field("arrived", &state.arrived)
            .finish()
    }
}
