// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Condition-variable + mutex pairing used to sleep/wake a single reader
// thread parked on an otherwise lock-free queue. The mutex guards nothing
// but the sleep itself: the queue's head/tail indices are synchronized
// through atomics, not this lock.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::lock_or_exit;

/// A condition variable paired with the lock used only to serialize
/// sleeper registration against the waker. Mirrors the `(cond, lock)` pair
/// threaded through every blocking wait in the relay's concurrency model.
#[derive(Default)]
pub struct Waiter {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Block while `pred` returns `true`, waking on every `notify`/`broadcast`
    /// to re-check it. Returns `false` if `timeout` elapses with `pred` still
    /// true, `true` once `pred` becomes false.
    pub fn wait_while<F>(&self, timeout: Option<Duration>, mut pred: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let guard = lock_or_exit(self.lock.lock(), "channel waiter");
        match timeout {
            None => {
                let _guard = lock_or_exit(
                    self.cond.wait_while(guard, |_| pred()),
                    "channel waiter",
                );
                true
            }
            Some(d) => {
                let (_guard, res) = lock_or_exit(
                    self.cond.wait_timeout_while(guard, d, |_| pred()),
                    "channel waiter",
                );
                !res.timed_out()
            }
        }
    }

    /// Briefly take the lock (a barrier ensuring a concurrent sleeper is
    /// fully parked in `cond.wait`) then wake one waiter.
    pub fn notify_one(&self) {
        let g: MutexGuard<'_, ()> = lock_or_exit(self.lock.lock(), "channel waiter");
        drop(g);
        self.cond.notify_one();
    }

    /// Same as [`Waiter::notify_one`] but wakes every parked thread.
    pub fn notify_all(&self) {
        let g: MutexGuard<'_, ()> = lock_or_exit(self.lock.lock(), "channel waiter");
        drop(g);
        self.cond.notify_all();
    }
}
