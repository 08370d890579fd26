//! Reusable rendezvous barrier for the per-device init protocol
//!
//! [`Barrier`] releases all `n` participants of one generation atomically
//! once the `n`-th has called [`wait`](Barrier::wait), then advances to the
//! next generation so the same instance can be reused. Unlike
//! `std::sync::Barrier`, the participant count can be reconfigured between
//! generations via [`reset`](Barrier::reset).
//!
//! No timeout: a stalled participant stalls everyone. That is the accepted
//! trade-off for the one-time initialization path.

use std::sync::{Condvar, Mutex};

struct BarrierState {
    /// Participant count for the current generation.
    count: usize,
    /// Participants currently blocked in `wait`.
    waiting: usize,
    /// Completed generations; waiters leave when this advances.
    generation: u64,
}

/// A reusable, resettable rendezvous barrier.
pub struct Barrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl Barrier {
    /// Create a barrier for `count` participants.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                count,
                waiting: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Configure the participant count for the next generation.
    ///
    /// Must not be called while participants are blocked in
    /// [`wait`](Barrier::wait) — that is the caller's responsibility,
    /// exactly as over-subscribing a generation is.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn reset(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.count = count;
        state.waiting = 0;
    }

    /// Block until all participants of the current generation have arrived.
    ///
    /// The last arrival releases every waiter and advances the generation.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == state.count {
            state.waiting = 0;
            state.generation += 1;
            self.cvar.notify_all();
        } else {
            while state.generation == generation {
                state = self.cvar.wait(state).unwrap();
            }
        }
    }
}
