use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::PipeError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A one-shot wake-up a thread can park on.
///
/// Register with [`MessagePipe::add_waiter`](crate::MessagePipe::add_waiter),
/// then call [`wait`](Waiter::wait). The pipe wakes the waiter with the
/// registration context when the awaited condition becomes true, with
/// [`PipeError::Cancelled`] when the watched port closes, or with
/// [`PipeError::NeverSatisfiable`] when the condition becomes impossible.
/// The result is sticky until [`reset`](Waiter::reset).
pub struct Waiter {
    state: Mutex<Option<Result<u64, PipeError>>>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Deliver a result and wake the parked thread. First wake wins.
    pub fn wake(&self, result: Result<u64, PipeError>) {
        let mut state = lock(&self.state);
        if state.is_none() {
            *state = Some(result);
            self.cond.notify_all();
        }
    }

    /// Block until woken or until `timeout` passes.
    ///
    /// `None` waits forever. Returns the registration context on a
    /// satisfied-condition wake, or the wake's error; `PipeError::TimedOut`
    /// if the deadline passes first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<u64, PipeError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.state);
        loop {
            if let Some(result) = *state {
                return result;
            }
            match deadline {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipeError::TimedOut);
                    }
                    let (guard, _timeout) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    /// Clear a delivered result so the waiter can be registered again.
    pub fn reset(&self) {
        *lock(&self.state) = None;
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}
