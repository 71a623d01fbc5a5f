// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Error taxonomy for the queue and the relay's control plane. Mutex and
// condition-variable failures have no recoverable path in this design: a
// poisoned lock or a failed syscall that should never fail is treated as
// a programmer error or resource exhaustion the core cannot reason about,
// so callers escalate it to process exit with `consts::exit_code::PANIC`.

use std::sync::LockResult;

use thiserror::Error;
use tracing::error;

use crate::consts::exit_code;

/// Errors returned by [`crate::queue::FifoQueue`] operations.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum QueueError {
    #[error("bad parameter passed to queue operation")]
    BadParameter,
    #[error("queue full; item discarded")]
    ItemDiscarded,
    #[error("queue empty; nothing to dequeue")]
    Empty,
    #[error("destination buffer too small for next item")]
    InadequateSpace,
}

/// Fatal, unrecoverable failures in the relay's concurrency primitives.
///
/// The original design calls `exit(EXIT_PANIC)` the moment a mutex
/// operation fails. `PoisonedLock` and `Impossible` are terminal at the
/// point of detection (see [`lock_or_exit`]) rather than propagated; `Io`
/// is the one variant a caller (`Endpoint::bind`) still returns up to
/// `main`, which logs it and exits with the matching code.
#[derive(Debug, Error)]
pub enum RelayPanic {
    #[error("a worker thread observed a poisoned lock: {0}")]
    PoisonedLock(String),
    #[error("channel state machine reached an impossible configuration: {0}")]
    Impossible(String),
    #[error("I/O setup failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Unwrap a lock result, terminating the process immediately with
/// `exit_code::PANIC` on poison instead of propagating the poison further.
/// `context` names the lock for the log line (e.g. `"channel helper
/// waiter"`), since a poison this deep in the relay has no recovery path
/// worth building -- another thread already panicked holding the lock, so
/// its invariants cannot be trusted.
pub fn lock_or_exit<T>(result: LockResult<T>, context: &str) -> T {
    match result {
        Ok(guard) => guard,
        Err(_poisoned) => {
            let panic = RelayPanic::PoisonedLock(context.to_string());
            error!(error = %panic, "terminating on poisoned lock");
            std::process::exit(exit_code::PANIC);
        }
    }
}
