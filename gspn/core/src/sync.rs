use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Why [`WakeSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Someone raised the signal.
    Signaled,
    /// The deadline passed first.
    TimedOut,
}

/// Single-consumer wake flag for the worker thread.
///
/// Any number of raises before the consumer waits collapse into one wake.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    /// Create a lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Safe to call from interrupt callbacks.
    pub fn raise(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Wait until raised or until `deadline`; `None` waits forever. Consumes the raise.
    pub fn wait(&self, deadline: Option<Instant>) -> WakeReason {
        let mut pending = self.pending.lock();
        while !*pending {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut pending, deadline).timed_out() && !*pending {
                        return WakeReason::TimedOut;
                    }
                }
                None => self.cond.wait(&mut pending),
            }
        }
        *pending = false;
        WakeReason::Signaled
    }
}

/// Broadcast notification for waiters that re-check shared state.
///
/// Notifiers must update the state they publish before calling
/// [`Event::notify_all`]; waiters evaluate their predicate under the event
/// lock, so a notification can never slip between the check and the sleep.
#[derive(Debug, Default)]
pub struct Event {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Event {
    /// Create an event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until `ready` holds or `deadline` passes; returns the final value of `ready`.
    pub fn wait_until(&self, deadline: Instant, mut ready: impl FnMut() -> bool) -> bool {
        let mut generation = self.generation.lock();
        loop {
            if ready() {
                return true;
            }
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                return ready();
            }
        }
    }
}

/// Completion keyed by round number.
///
/// A waiter for round `n` is only released by a completion of round `n` or
/// later, so a late completion of an earlier round cannot satisfy it.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<u64>,
    cond: Condvar,
}

impl Completion {
    /// Create a completion with no finished rounds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `round` complete and wake waiters.
    pub fn complete(&self, round: u64) {
        let mut done = self.done.lock();
        if round > *done {
            *done = round;
        }
        self.cond.notify_all();
    }

    /// Latest completed round.
    pub fn completed_round(&self) -> u64 {
        *self.done.lock()
    }

    /// Wait until `round` is complete or `deadline`; returns whether it completed.
    pub fn wait_until(&self, round: u64, deadline: Instant) -> bool {
        let mut done = self.done.lock();
        while *done < round {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done >= round;
            }
        }
        true
    }
}
