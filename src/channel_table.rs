// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};

use crate::channel::Channel;
use crate::consts::MAX_CHANNELS;
use crate::error::lock_or_exit;

/// A counting semaphore tracking how many channel slots are currently
/// inactive, so the target-mode accept loop can block until one frees up
/// instead of busy-polling `Channel::active`.
pub struct ChannelSemaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl ChannelSemaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then consume one.
    pub fn acquire(&self) {
        let mut count = lock_or_exit(self.count.lock(), "channel semaphore");
        while *count == 0 {
            count = lock_or_exit(self.cond.wait(count), "channel semaphore");
        }
        *count -= 1;
    }

    /// Return a permit, waking one waiter if any are blocked.
    pub fn release(&self) {
        let mut count = lock_or_exit(self.count.lock(), "channel semaphore");
        *count += 1;
        self.cond.notify_one();
    }
}

/// The fixed set of channels multiplexed onto one UDP socket.
pub struct ChannelTable {
    pub channels: Vec<Channel>,
    pub free_slots: ChannelSemaphore,
    /// Serializes the scan-for-inactive-slot + activate sequence in the
    /// target-mode accept loop. Uncontended in practice (only the accept
    /// loop calls this), but the lock still orders the channel's fd/state
    /// writes before any concurrent reader observes `active == true`.
    accept_lock: Mutex<()>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            channels: (0..MAX_CHANNELS as u8).map(Channel::new).collect(),
            free_slots: ChannelSemaphore::new(MAX_CHANNELS),
            accept_lock: Mutex::new(()),
        }
    }

    /// Find an inactive channel slot. Only meaningful in target mode,
    /// after `free_slots.acquire()` has confirmed one exists; in the
    /// pathological case where bookkeeping and reality have drifted this
    /// returns `None` rather than panicking.
    pub fn find_inactive(&self) -> Option<&Channel> {
        self.channels.iter().find(|c| !c.active.load(Ordering::Acquire))
    }

    /// Bind `fd` to the first inactive channel and activate it. Call only
    /// after `free_slots.acquire()` guarantees one exists.
    pub fn bind_inactive(&self, fd: RawFd) -> Option<&Channel> {
        let _guard = lock_or_exit(self.accept_lock.lock(), "accept lock");
        let ct = self.find_inactive();
        if let Some(ct) = ct {
            ct.activate(fd);
        }
        ct
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}
