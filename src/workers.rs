// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// The four worker bodies that service one channel (helper, sender,
// receiver) or the whole endpoint (demultiplexer). Each is spawned once
// per channel (or once total, for the demultiplexer) and runs for the
// lifetime of the process, cycling through activation and deactivation as
// TCP connections come and go.

use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelState};
use crate::consts::{
    ack_timeout, epoch_is_earlier, max_retries, next_seq, prev_seq, seq_distance, PACKET_LEN,
    PAYLOAD_MAX, SWP_BUFFER_SIZE,
};
use crate::endpoint::{Endpoint, RelayMode};
use crate::error::QueueError;
use crate::packet::{FrameChannel, Packet};

/// Write `buf` to `fd` in full, retrying on `EINTR`, the way the original
/// relay's blocking write wrapper does.
fn write_all_fd(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        // Safety: `fd` is a valid, open fd for the duration of this call,
        // guaranteed by the channel's activation/deactivation protocol.
        let n = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const _,
                buf.len() - written,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += n as usize;
    }
    Ok(())
}

/// Poll `fd` for readability, retrying on `EINTR`. Returns `true` if `fd`
/// is readable, `false` if `wake_fd` (the channel's self-pipe) fired
/// instead -- the caller should drain it and re-check channel state.
fn poll_readable(fd: RawFd, wake_fd: RawFd) -> io::Result<bool> {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        // Safety: `fds` is a valid, correctly-sized pollfd array.
        let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if fds[1].revents & libc::POLLIN != 0 {
            return Ok(false);
        }
        if fds[0].revents & libc::POLLIN != 0 {
            return Ok(true);
        }
    }
}

/// Record a worker's deactivation and, once all three have reported in
/// while running as the target, return the freed slot to the channel
/// table's semaphore so the accept loop can reuse it.
fn finish_deactivate(ct: &Channel, flag: ChannelState, endpoint: &Endpoint) {
    let (_, became_all) = ct.deactivate(flag);
    if became_all && endpoint.mode == RelayMode::Target {
        endpoint.table.free_slots.release();
    }
}

/// Body of the TCP helper thread: polls the channel's TCP fd and signals
/// the sender once data is ready to read, so the sender never blocks in
/// `read` while holding up ACK processing.
pub fn tcp_helper(ct: &Channel, endpoint: &Endpoint) -> io::Result<()> {
    loop {
        ct.help
            .wait_while(None, || ct.state().contains(ChannelState::HELPER));
        debug!(channel = ct.number, "helper activated");

        loop {
            if ct.state() != ChannelState::NONE {
                finish_deactivate(ct, ChannelState::HELPER, endpoint);
                debug!(channel = ct.number, "helper deactivated");
                break;
            }

            if ct.need_help.load(Ordering::Acquire) {
                match poll_readable(ct.fd(), ct.wake_read_fd()) {
                    Ok(true) => {
                        ct.need_help.store(false, Ordering::Release);
                        ct.has_data.store(true, Ordering::Release);
                        ct.udp[0].waiter().notify_all();
                    }
                    Ok(false) => {
                        ct.drain_wake_pipe();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            ct.help.wait_while(None, || {
                !ct.need_help.load(Ordering::Acquire) && ct.state() == ChannelState::NONE
            });
        }
    }
}

#[derive(Default)]
struct SenderWindow {
    seq: u8,
    lar: u8,
    tcp_closed: bool,
    retries: u32,
    inflight: HashMap<u8, Packet>,
}

impl SenderWindow {
    fn reset(&mut self) {
        self.seq = 0;
        self.lar = prev_seq(0);
        self.tcp_closed = false;
        self.retries = 0;
        self.inflight.clear();
    }
}

/// Body of the TCP sender thread: drains TCP reads into outbound data
/// frames and advances the sliding window as ACKs arrive, retransmitting
/// the unacknowledged tail on timeout up to [`crate::consts::max_retries`] times before
/// giving up and resetting the channel.
pub fn tcp_sender(ct: &Channel, endpoint: &Endpoint) -> io::Result<()> {
    let mut is_active = false;
    let mut w = SenderWindow::default();

    loop {
        if !is_active {
            if !ct.state().contains(ChannelState::SENDER) {
                is_active = true;
                w.reset();
                debug!(channel = ct.number, "sender activated");
                continue;
            }
            ct.udp[0]
                .waiter()
                .wait_while(None, || ct.state().contains(ChannelState::SENDER));
            continue;
        } else if ct.state() != ChannelState::NONE {
            finish_deactivate(ct, ChannelState::SENDER, endpoint);
            is_active = false;
            debug!(channel = ct.number, "sender deactivated");
            continue;
        }

        if ct.has_data.swap(false, Ordering::AcqRel) {
            let mut buf = [0u8; PAYLOAD_MAX];
            // Safety: `fd` is valid TCP fd owned by this channel while active.
            let n = unsafe { libc::read(ct.fd(), buf.as_mut_ptr() as *mut _, PAYLOAD_MAX) };
            if n < 0 {
                warn!(channel = ct.number, "tcp read failed in sender");
                finish_deactivate(ct, ChannelState::SENDER, endpoint);
                is_active = false;
                continue;
            }
            if n == 0 {
                w.tcp_closed = true;
            }
            let epoch = ct.epoch.load(Ordering::Acquire);
            let pkt = Packet::build(
                w.tcp_closed,
                w.seq,
                epoch,
                FrameChannel::Data(ct.number),
                &buf[..n as usize],
            );
            w.inflight.insert(w.seq, pkt.clone());
            let _ = endpoint.udp.send(pkt.as_wire());
            debug!(channel = ct.number, seq = w.seq, "sent data frame");
            w.seq = next_seq(w.seq);
        }

        let mut raw = [0u8; PACKET_LEN];
        match ct.udp[0].recv.dequeue(&mut raw) {
            Ok(n) => {
                let Some(pkt) = Packet::parse(&raw[..n]) else {
                    continue;
                };
                if handle_ack(ct, &mut w, &pkt, &mut is_active) && endpoint.mode == RelayMode::Target {
                    endpoint.table.free_slots.release();
                }
            }
            Err(QueueError::Empty) => {
                if !w.tcp_closed {
                    ct.need_help.store(true, Ordering::Release);
                    ct.help.notify_all();
                }
                let outstanding = w.lar != prev_seq(w.seq);
                let got_something = ct.udp[0].waiter().wait_while(
                    if outstanding { Some(ack_timeout()) } else { None },
                    || {
                        ct.udp[0].recv.is_empty()
                            && !ct.has_data.load(Ordering::Acquire)
                            && ct.state() == ChannelState::NONE
                    },
                );
                if outstanding && !got_something {
                    w.retries += 1;
                    if w.retries > max_retries() {
                        warn!(channel = ct.number, "sender timed out, resetting channel");
                        finish_deactivate(ct, ChannelState::SENDER, endpoint);
                        is_active = false;
                        continue;
                    }
                    retransmit_window(endpoint, ct, &w);
                }
            }
            Err(_) => continue,
        }
    }
}

fn retransmit_window(endpoint: &Endpoint, ct: &Channel, w: &SenderWindow) {
    let mut s = w.lar;
    while s != w.seq {
        s = next_seq(s);
        if let Some(pkt) = w.inflight.get(&s) {
            let _ = endpoint.udp.send(pkt.as_wire());
            debug!(channel = ct.number, seq = s, "retransmitted data frame");
        }
    }
}

/// Process one ACK against the sender's window. Returns `true` when this
/// call completed the channel's three-way deactivation handshake, telling
/// the caller to return the slot to the table in target mode.
fn handle_ack(ct: &Channel, w: &mut SenderWindow, pkt: &Packet, is_active: &mut bool) -> bool {
    if !*is_active || pkt.epoch() != ct.epoch.load(Ordering::Acquire) {
        return false;
    }
    let acked = pkt.seq_num();
    if acked == w.lar {
        return false; // duplicate ack, already accounted for
    }
    let dist = seq_distance(w.lar, acked);
    let outstanding = seq_distance(w.lar, w.seq);
    if dist == 0 || dist > outstanding {
        warn!(channel = ct.number, "out-of-window ack, resetting channel");
        let (_, became_all) = ct.deactivate(ChannelState::SENDER);
        *is_active = false;
        return became_all;
    }
    let mut s = w.lar;
    while s != acked {
        s = next_seq(s);
        w.inflight.remove(&s);
    }
    w.lar = acked;
    w.retries = 0;

    if pkt.is_last() && w.lar == prev_seq(w.seq) {
        info!(channel = ct.number, "send stream completed");
        let (_, became_all) = ct.deactivate(ChannelState::SENDER);
        *is_active = false;
        return became_all;
    }
    false
}

/// Open the forward-mode TCP connection for a freshly-activated channel.
fn open_and_activate_channel(ct: &Channel, endpoint: &Endpoint) -> io::Result<()> {
    let addr = endpoint
        .fwd_addr
        .expect("forward mode always carries a forwarding address");
    match TcpStream::connect(addr) {
        Ok(stream) => {
            ct.activate(stream.into_raw_fd());
        }
        Err(e) => {
            warn!(channel = ct.number, error = %e, "forwarding connect failed");
            ct.activate(-1);
        }
    }
    ct.wake_all_except(ChannelState::RECEIVER);
    Ok(())
}

/// Body of the TCP receiver thread: reassembles inbound data frames in
/// sequence order and writes them to the TCP connection, sending an ACK
/// for every frame received (in-window or not).
pub fn tcp_receiver(ct: &Channel, endpoint: &Endpoint) -> io::Result<()> {
    let mut is_active = false;
    let mut nfe: u8 = 0;
    let mut reorder: HashMap<u8, Packet> = HashMap::new();

    loop {
        if !is_active {
            if endpoint.mode == RelayMode::Target {
                if !ct.state().contains(ChannelState::RECEIVER) {
                    is_active = true;
                    nfe = 0;
                    reorder.clear();
                    debug!(channel = ct.number, "receiver activated");
                    continue;
                }
                ct.udp[1]
                    .waiter()
                    .wait_while(None, || ct.state().contains(ChannelState::RECEIVER));
                continue;
            }
        } else if ct.state() != ChannelState::NONE {
            finish_deactivate(ct, ChannelState::RECEIVER, endpoint);
            is_active = false;
            debug!(channel = ct.number, "receiver deactivated");
            continue;
        }

        let mut raw = [0u8; PACKET_LEN];
        let n = match ct.udp[1].recv.dequeue(&mut raw) {
            Ok(n) => n,
            Err(QueueError::Empty) => {
                ct.udp[1].waiter().wait_while(None, || {
                    ct.udp[1].recv.is_empty() && ct.state() == ChannelState::NONE
                });
                continue;
            }
            Err(_) => continue,
        };
        let Some(pkt) = Packet::parse(&raw[..n]) else {
            continue;
        };

        if endpoint.mode == RelayMode::Target {
            if !is_active || pkt.epoch() != ct.epoch.load(Ordering::Acquire) {
                continue;
            }
        } else {
            let incoming_epoch = pkt.epoch();
            let current_epoch = ct.epoch.load(Ordering::Acquire);
            if incoming_epoch != current_epoch {
                if epoch_is_earlier(incoming_epoch, current_epoch) {
                    continue;
                }
                if is_active {
                    info!(channel = ct.number, "new epoch, deactivating for reopen");
                    finish_deactivate(ct, ChannelState::RECEIVER, endpoint);
                    is_active = false;
                    ct.udp[1]
                        .waiter()
                        .wait_while(None, || ct.state() != ChannelState::ALL);
                    ct.epoch.store(incoming_epoch, Ordering::Release);
                }
            }
            if !is_active {
                open_and_activate_channel(ct, endpoint)?;
                is_active = true;
                nfe = 0;
                reorder.clear();
            }
        }

        let seq = pkt.seq_num();
        if seq_distance(nfe, seq) < SWP_BUFFER_SIZE as u8 {
            if seq == nfe {
                deliver(ct, &pkt, endpoint)?;
                nfe = next_seq(nfe);
                while let Some(buffered) = reorder.remove(&nfe) {
                    deliver(ct, &buffered, endpoint)?;
                    nfe = next_seq(nfe);
                }
            } else {
                reorder.insert(seq, pkt.clone());
            }
        }

        let epoch = ct.epoch.load(Ordering::Acquire);
        let ack = Packet::build(true, seq, epoch, FrameChannel::Ack(ct.number), &[]);
        let _ = endpoint.udp.send(ack.as_wire());

        if pkt.is_last() && nfe == seq {
            info!(channel = ct.number, "received last packet");
            finish_deactivate(ct, ChannelState::RECEIVER, endpoint);
            is_active = false;
        }
    }
}

fn deliver(ct: &Channel, pkt: &Packet, endpoint: &Endpoint) -> io::Result<()> {
    if let Err(e) = write_all_fd(ct.fd(), pkt.payload()) {
        warn!(channel = ct.number, error = %e, "tcp write failed in receiver");
        finish_deactivate(ct, ChannelState::RECEIVER, endpoint);
        return Err(e);
    }
    Ok(())
}

/// Body of the single UDP demultiplexer thread: routes every frame that
/// arrives on the shared socket to the receiving end's matching queue by
/// channel number, silently dropping anything that fails CRC or names an
/// out-of-range channel.
pub fn udp_demux(endpoint: &Endpoint) -> io::Result<()> {
    loop {
        let mut raw = [0u8; PACKET_LEN];
        let n = match endpoint.udp.recv(&mut raw) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let Some(pkt) = Packet::parse(&raw[..n]) else {
            continue;
        };
        let (index, queue_side) = match pkt.channel() {
            FrameChannel::Data(ch) => (ch as usize, 1),
            FrameChannel::Ack(ch) => (ch as usize, 0),
        };
        let Some(ct) = endpoint.table.channels.get(index) else {
            continue;
        };
        match ct.udp[queue_side].recv.enqueue(&raw[..n]) {
            Ok(()) => ct.udp[queue_side].waiter().notify_all(),
            Err(QueueError::ItemDiscarded) => {
                debug!(channel = index, "udp queue full, frame discarded");
            }
            Err(e) => warn!(channel = index, error = %e, "udp enqueue failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(seq: u8, epoch: u8, is_last: bool) -> Packet {
        Packet::build(is_last, seq, epoch, FrameChannel::Ack(0), &[])
    }

    #[test]
    fn duplicate_ack_is_ignored() {
        let ct = Channel::new(0);
        let mut w = SenderWindow::default();
        w.reset();
        w.seq = 3;
        w.lar = 1;
        let mut active = true;
        handle_ack(&ct, &mut w, &ack(1, 0, false), &mut active);
        assert!(active);
        assert_eq!(w.lar, 1);
    }

    #[test]
    fn in_window_ack_advances_lar_and_clears_inflight() {
        let ct = Channel::new(0);
        let mut w = SenderWindow::default();
        w.reset();
        w.seq = 3;
        w.lar = prev_seq(0);
        w.inflight.insert(0, ack(0, 0, false));
        w.inflight.insert(1, ack(1, 0, false));
        let mut active = true;
        handle_ack(&ct, &mut w, &ack(1, 0, false), &mut active);
        assert!(active);
        assert_eq!(w.lar, 1);
        assert!(w.inflight.is_empty());
        assert_eq!(w.retries, 0);
    }

    #[test]
    fn out_of_window_ack_deactivates_sender() {
        let ct = Channel::new(0);
        let mut w = SenderWindow::default();
        w.reset();
        w.seq = 3;
        w.lar = prev_seq(0);
        let mut active = true;
        let became_all = handle_ack(&ct, &mut w, &ack(200 & 0x7F, 0, false), &mut active);
        assert!(!active);
        assert!(ct.state().contains(ChannelState::SENDER));
        assert!(!became_all, "helper and receiver have not reported in yet");
    }

    #[test]
    fn last_packet_ack_completes_stream() {
        let ct = Channel::new(0);
        let mut w = SenderWindow::default();
        w.reset();
        w.seq = 1;
        w.lar = prev_seq(0);
        let mut active = true;
        let became_all = handle_ack(&ct, &mut w, &ack(0, 0, true), &mut active);
        assert!(!active);
        assert!(ct.state().contains(ChannelState::SENDER));
        assert!(!became_all, "helper and receiver have not reported in yet");
    }

    #[test]
    fn ack_with_mismatched_epoch_is_discarded() {
        let ct = Channel::new(0);
        ct.epoch.store(5, Ordering::Relaxed);
        let mut w = SenderWindow::default();
        w.reset();
        w.seq = 3;
        w.lar = prev_seq(0);
        let mut active = true;
        handle_ack(&ct, &mut w, &ack(1, 0, false), &mut active);
        assert!(active);
        assert_eq!(w.lar, prev_seq(0));
    }
}
