//! Long-term lock whose waiters can be woken with an error.
//!
//! Holding a [`SleepLock`] across block I/O is expected. A thread waiting
//! for it gives up with [`FsError::Interrupted`] when [`SleepLock::interrupt`]
//! is called during the wait; the current holder is not affected.

use super::*;

use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct LockState {
    locked: bool,
    /// bumped by every interrupt, waiters compare it with the value seen on entry
    signals: u64,
}

pub struct SleepLock<T> {
    name: &'static str,
    state: Mutex<LockState>,
    cv: Condvar,
    data: Mutex<T>,
}

pub struct SleepGuard<'a, T> {
    lock: &'a SleepLock<T>,
    data: MutexGuard<'a, T>,
}

impl<T> SleepLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            state: Mutex::new(LockState {
                locked: false,
                signals: 0,
            }),
            cv: Condvar::new(),
            data: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> Result<SleepGuard<'_, T>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = state.signals;
        while state.locked {
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            if state.signals != seen {
                debug!("wait for the {} lock interrupted", self.name);
                return Err(FsError::Interrupted(self.name));
            }
        }
        state.locked = true;
        drop(state);

        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(SleepGuard { lock: self, data })
    }

    /// Wake every thread currently waiting for this lock with an error.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.signals = state.signals.wrapping_add(1);
        self.cv.notify_all();
    }

    #[cfg(test)]
    fn into_inner(self) -> T {
        self.data.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Deref for SleepGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for SleepGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T> Drop for SleepGuard<'_, T> {
    fn drop(&mut self) {
        // `data` is released right after this; a woken waiter blocks on it briefly
        let mut state = self
            .lock
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.locked = false;
        // every waiter re-checks, an interrupted one must not swallow the wakeup
        self.lock.cv.notify_all();
    }
}
