// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Exercises the channel table's accept-path bookkeeping: binding an
// inactive slot, releasing it back through deactivation, and the
// semaphore invariant that ties slot count to active-channel count.

use std::sync::Arc;
use std::thread;

use udprelay::{Channel, ChannelState, ChannelTable};

#[test]
fn bind_inactive_activates_first_free_slot() {
    let table = ChannelTable::new();
    let ct = table.bind_inactive(11).expect("a slot is free on a fresh table");
    assert_eq!(ct.fd(), 11);
    assert_eq!(ct.state(), ChannelState::NONE);
}

#[test]
fn bound_slot_is_skipped_by_the_next_bind() {
    let table = ChannelTable::new();
    let first = table.bind_inactive(1).unwrap().number;
    let second = table.bind_inactive(2).unwrap().number;
    assert_ne!(first, second);
}

#[test]
fn deactivated_slot_becomes_available_again() {
    let table = ChannelTable::new();
    let number = table.bind_inactive(5).unwrap().number;
    let ct: &Channel = &table.channels[number as usize];
    ct.deactivate(ChannelState::HELPER);
    ct.deactivate(ChannelState::SENDER);
    let (_, became_all) = ct.deactivate(ChannelState::RECEIVER);
    assert!(became_all);
    assert!(table.find_inactive().is_some());
    assert_eq!(table.channels[number as usize].fd(), -1);
}

#[test]
fn semaphore_blocks_until_a_slot_is_released() {
    let table = Arc::new(ChannelTable::new());
    for _ in 0..table.channels.len() {
        table.free_slots.acquire();
    }

    let waiter = {
        let table = Arc::clone(&table);
        thread::spawn(move || {
            table.free_slots.acquire();
            "unblocked"
        })
    };

    thread::sleep(std::time::Duration::from_millis(50));
    assert!(!waiter.is_finished(), "acquire should block with no free slots");

    table.free_slots.release();
    assert_eq!(waiter.join().unwrap(), "unblocked");
}

#[test]
fn concurrent_binds_never_double_assign_a_slot() {
    let table = Arc::new(ChannelTable::new());
    let handles: Vec<_> = (0..table.channels.len() as i32)
        .map(|fd| {
            let table = Arc::clone(&table);
            thread::spawn(move || table.bind_inactive(fd).map(|c| c.number))
        })
        .collect();

    let mut numbers: Vec<u8> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("table has exactly enough slots"))
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    assert_eq!(numbers.len(), table.channels.len());
}
