// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Exercises Waiter's broadcast/timeout semantics as used by the channel
// state machine and the send/receive queues.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use udprelay::waiter::Waiter;

#[test]
fn notify_all_wakes_every_sleeper() {
    let waiter = Arc::new(Waiter::new());
    let ready = Arc::new(AtomicI32::new(0));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let waiter = Arc::clone(&waiter);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                waiter.wait_while(Some(Duration::from_secs(5)), || {
                    ready.load(Ordering::Acquire) == 0
                })
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    ready.store(1, Ordering::Release);
    waiter.notify_all();

    for t in threads {
        assert!(t.join().unwrap(), "every waiter should observe the predicate clear");
    }
}

#[test]
fn wait_while_times_out_when_never_notified() {
    let waiter = Waiter::new();
    let woke = waiter.wait_while(Some(Duration::from_millis(50)), || true);
    assert!(!woke);
}

#[test]
fn notify_one_wakes_a_single_sleeper_at_a_time() {
    let waiter = Arc::new(Waiter::new());
    let woken = Arc::new(AtomicI32::new(0));
    let release = Arc::new(AtomicI32::new(0));

    let threads: Vec<_> = (0..2)
        .map(|_| {
            let waiter = Arc::clone(&waiter);
            let woken = Arc::clone(&woken);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                waiter.wait_while(Some(Duration::from_secs(5)), || {
                    release.load(Ordering::Acquire) == 0
                });
                woken.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    release.store(1, Ordering::Release);
    waiter.notify_one();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        woken.load(Ordering::Acquire),
        1,
        "only the notified thread should have observed the cleared predicate"
    );

    waiter.notify_one();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::Acquire), 2);
}
