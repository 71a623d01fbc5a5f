// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors

use std::sync::OnceLock;
use std::time::Duration;

/// Number of logical channels multiplexed onto the shared UDP socket.
pub const MAX_CHANNELS: usize = 16;

/// Fixed wire-frame size, in bytes.
pub const PACKET_LEN: usize = 256;

/// Maximum TCP payload bytes per frame (bytes 4..255).
pub const PAYLOAD_MAX: usize = 251;

/// Sliding-window width: how many sequence numbers ahead of the base a
/// sender/receiver will still accept without treating the packet as
/// out-of-window.
pub const SWP_BUFFER_SIZE: usize = 32;

/// Default TCP port for the target end of the relay.
pub const RELAY_SERVER_PORT: u16 = 4321;

/// Default TCP port for the forwarding end of the relay (HTTP).
pub const WEB_SERVER_PORT: u16 = 80;

/// Backlog for the target's listening TCP socket.
pub const SERVER_QUEUE: i32 = 10;

/// Default sender ACK timeout, used when `RELAY_ACK_TIMEOUT_MS` is unset or
/// unparsable.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default retransmit budget, used when `RELAY_MAX_RETRIES` is unset or
/// unparsable.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long a sender waits for an ACK before retransmitting (or resetting
/// the channel once retries are exhausted). Overridable via
/// `RELAY_ACK_TIMEOUT_MS`, read once and cached for the life of the
/// process.
pub fn ack_timeout() -> Duration {
    static VALUE: OnceLock<Duration> = OnceLock::new();
    *VALUE.get_or_init(|| {
        std::env::var("RELAY_ACK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ACK_TIMEOUT)
    })
}

/// How many times a sender retransmits its in-flight window before it
/// gives up and resets the channel (see DESIGN.md, "sender timeout
/// policy"). Overridable via `RELAY_MAX_RETRIES`, read once and cached for
/// the life of the process.
pub fn max_retries() -> u32 {
    static VALUE: OnceLock<u32> = OnceLock::new();
    *VALUE.get_or_init(|| {
        std::env::var("RELAY_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES)
    })
}

/// Send/receive buffer size applied to the shared UDP socket.
pub const UDP_SOCKET_BUF: usize = 40_000;

/// Process exit codes, matching the relay's historical ABI.
pub mod exit_code {
    pub const NORMAL: i32 = 0;
    pub const ABNORMAL: i32 = 1;
    pub const PARSE_OPTS: i32 = 2;
    pub const PANIC: i32 = 3;
}

/// `(a + 1) mod 128`.
#[inline]
pub const fn next_seq(n: u8) -> u8 {
    (n + 1) & 0x7F
}

/// `(a - 1) mod 128`.
#[inline]
pub const fn prev_seq(n: u8) -> u8 {
    (n.wrapping_add(0x7F)) & 0x7F
}

/// Cyclic distance `(to - from) mod 128`, used to test whether a sequence
/// number lies within a forward window without wraparound edge cases.
#[inline]
pub const fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & 0x7F
}

/// `((f - e) mod 256) <= 128`: true when epoch `e` is no later than epoch
/// `f` under a cyclic 256-epoch space split at the midpoint. Callers only
/// consult this once `e != f` is already known, where it reduces to
/// "`e` is the older of the two".
#[inline]
pub const fn epoch_is_earlier(e: u8, f: u8) -> bool {
    (f.wrapping_sub(e) as u32) <= 128
}
