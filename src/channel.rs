// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Per-channel state shared between the four worker threads that service
// one TCP connection: a helper (polls the TCP socket for readability), a
// sender (drains TCP into outbound UDP frames), a receiver (writes inbound
// UDP frames back to TCP), and the demultiplexer (routes UDP frames by
// channel number into the right queue). Deactivation is a three-way
// handshake tracked in `channel_state`: the last of {helper, sender,
// receiver} to acknowledge shutdown closes the TCP socket and bumps the
// epoch so that stale packets from the previous connection are ignored.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use bitflags::bitflags;

use crate::consts::PACKET_LEN;
use crate::queue::FifoQueue;
use crate::waiter::Waiter;

bitflags! {
    /// Which worker threads have acknowledged a pending deactivation.
    /// `ALL` set means the channel is fully quiesced and may be reused.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChannelState: u8 {
        const NONE     = 0;
        const HELPER   = 1;
        const RECEIVER = 2;
        const SENDER   = 4;
        const ALL      = 0b111;
    }
}

/// One direction of UDP traffic for a channel: an inbound frame queue. The
/// queue's own waiter doubles as the signal for channel activation and
/// deactivation, exactly as the original's single `recv_cond` is shared
/// between packet arrival and channel-state wakeups.
pub struct UdpChannel {
    pub recv: FifoQueue,
}

impl UdpChannel {
    pub fn new() -> Self {
        Self {
            recv: FifoQueue::create(32, PACKET_LEN).expect("static queue parameters are valid"),
        }
    }

    pub fn waiter(&self) -> &Waiter {
        self.recv.waiter()
    }
}

impl Default for UdpChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the four workers servicing a single TCP<->UDP channel.
pub struct Channel {
    /// Index of this channel in its [`crate::channel_table::ChannelTable`].
    pub number: u8,
    /// Bumped every time the channel's TCP connection is torn down, so
    /// frames tagged with a stale epoch are discarded rather than
    /// misdelivered to the next connection assigned to this slot.
    pub epoch: AtomicU8,
    /// Raw fd for the TCP connection, or -1 when none is bound. Stored as
    /// a raw fd rather than an owned `TcpStream` because the helper,
    /// sender, and receiver threads each need concurrent access to it
    /// (poll, read, write respectively) and Rust's stream type cannot be
    /// shared that way without an exclusive-access wrapper none of the
    /// three actually needs.
    pub fd: AtomicI32,
    /// Target mode only: whether the main accept loop has bound a live
    /// connection to this slot.
    pub active: AtomicBool,
    pub state: AtomicU8,
    /// Set when the sender has drained its last read and is waiting on
    /// the helper to signal more data.
    pub need_help: AtomicBool,
    /// Set by the helper once poll() reports the TCP socket is readable.
    pub has_data: AtomicBool,
    pub help: Waiter,
    /// Channel 0: carries TCP-to-UDP (sender) traffic and its ACKs.
    /// Channel 1: carries UDP-to-TCP (receiver) traffic and its ACKs.
    pub udp: [UdpChannel; 2],
    /// Read end of a self-pipe the helper thread includes in its poll
    /// set, so deactivation can interrupt a blocked poll without relying
    /// on signal delivery to a specific thread.
    wake_read: RawFd,
    wake_write: RawFd,
}

impl Channel {
    pub fn new(number: u8) -> Self {
        let mut fds = [0 as RawFd; 2];
        // Safety: `fds` is a valid 2-element buffer for pipe2 to fill.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            panic!("pipe2 failed: {}", std::io::Error::last_os_error());
        }
        Self {
            number,
            epoch: AtomicU8::new(0),
            fd: AtomicI32::new(-1),
            active: AtomicBool::new(false),
            state: AtomicU8::new(ChannelState::ALL.bits()),
            need_help: AtomicBool::new(false),
            has_data: AtomicBool::new(false),
            help: Waiter::new(),
            udp: [UdpChannel::new(), UdpChannel::new()],
            wake_read: fds[0],
            wake_write: fds[1],
        }
    }

    /// The fd the helper's poll set should include alongside the TCP fd.
    pub fn wake_read_fd(&self) -> RawFd {
        self.wake_read
    }

    /// Drain any pending wake bytes after poll returns readable on the
    /// self-pipe.
    pub fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // Safety: `wake_read` is a valid, open, non-blocking fd owned
            // by this channel for its entire lifetime.
            let n = unsafe { libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    fn interrupt_poll(&self) {
        let byte = [1u8];
        // Safety: see `drain_wake_pipe`; a full pipe (EAGAIN) is fine,
        // it already has a byte pending to wake the poller.
        unsafe {
            libc::write(self.wake_write, byte.as_ptr() as *const _, 1);
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Record that the worker identified by `flag` has recognized this
    /// channel's deactivation. Once all three have, close the TCP socket
    /// and bump the epoch. Returns `(was_first, became_all)`: `was_first`
    /// is true for exactly the caller that observed the transition away
    /// from `NONE`, so that caller (and only that caller) wakes the other
    /// two workers; `became_all` is true for exactly the caller that
    /// completed the handshake, so that caller (and only that caller)
    /// should release the slot back to its table in target mode.
    pub fn deactivate(&self, flag: ChannelState) -> (bool, bool) {
        let mut was_first = false;
        let mut became_all = false;
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let cur_flags = ChannelState::from_bits_truncate(cur);
            was_first = cur_flags == ChannelState::NONE;
            let next = cur_flags | flag;
            if self
                .state
                .compare_exchange(cur, next.bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                became_all = next == ChannelState::ALL;
                break;
            }
        }
        if became_all {
            let fd = self.fd.swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                // Safety: `fd` was produced by `into_raw_fd` on a TCP
                // stream this channel owned exclusively; no other code
                // path closes it.
                unsafe {
                    libc::close(fd);
                }
            }
            self.epoch.fetch_add(1, Ordering::AcqRel);
            self.active.store(false, Ordering::Release);
        }
        if was_first {
            self.wake_all_except(flag);
        }
        (was_first, became_all)
    }

    /// Reset deactivation bookkeeping and bind a fresh TCP fd, readying
    /// the channel for its next set of workers to activate against.
    pub fn activate(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
        self.need_help.store(false, Ordering::Release);
        self.has_data.store(false, Ordering::Release);
        self.active.store(true, Ordering::Release);
        self.state.store(ChannelState::NONE.bits(), Ordering::Release);
    }

    /// Wake every worker not named in `ignore`. Called after activation or
    /// deactivation so sleeping threads re-check `state`/`need_help`.
    pub fn wake_all_except(&self, ignore: ChannelState) {
        if !ignore.contains(ChannelState::HELPER) {
            self.help.notify_all();
            self.interrupt_poll();
        }
        if !ignore.contains(ChannelState::RECEIVER) {
            self.udp[1].waiter().notify_all();
        }
        if !ignore.contains(ChannelState::SENDER) {
            self.udp[0].waiter().notify_all();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Safety: both ends were opened by this instance and are closed
        // exactly once here.
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_starts_fully_deactivated() {
        let ct = Channel::new(0);
        assert_eq!(ct.state(), ChannelState::ALL);
        assert_eq!(ct.fd(), -1);
    }

    #[test]
    fn activate_clears_state_and_binds_fd() {
        let ct = Channel::new(0);
        ct.activate(42);
        assert_eq!(ct.state(), ChannelState::NONE);
        assert_eq!(ct.fd(), 42);
        assert!(ct.active.load(Ordering::Acquire));
    }

    #[test]
    fn deactivation_requires_all_three_workers() {
        let ct = Channel::new(0);
        ct.activate(7);
        assert_eq!(ct.deactivate(ChannelState::HELPER), (true, false));
        assert_eq!(ct.deactivate(ChannelState::SENDER), (false, false));
        assert_eq!(ct.fd(), 7, "fd stays open until the last worker reports in");
        assert_eq!(ct.deactivate(ChannelState::RECEIVER), (false, true));
        assert_eq!(ct.state(), ChannelState::ALL);
        assert_eq!(ct.fd(), -1, "last worker closes the fd");
    }

    #[test]
    fn deactivation_bumps_epoch_exactly_once() {
        let ct = Channel::new(0);
        ct.activate(7);
        let before = ct.epoch.load(Ordering::Acquire);
        ct.deactivate(ChannelState::HELPER);
        ct.deactivate(ChannelState::SENDER);
        ct.deactivate(ChannelState::RECEIVER);
        assert_eq!(ct.epoch.load(Ordering::Acquire), before + 1);
    }
}
