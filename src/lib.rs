// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Bidirectional TCP relay tunneled over an unreliable UDP substrate. One
// shared UDP socket multiplexes up to `MAX_CHANNELS` independent TCP
// connections, each carried by its own sliding-window reliable-delivery
// session and serviced by a helper/sender/receiver thread trio.

pub mod channel;
pub mod channel_table;
pub mod consts;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod queue;
pub mod waiter;
pub mod workers;

pub use channel::{Channel, ChannelState};
pub use channel_table::{ChannelSemaphore, ChannelTable};
pub use endpoint::{Endpoint, RelayMode};
pub use error::{QueueError, RelayPanic};
pub use packet::{FrameChannel, Packet};
pub use queue::FifoQueue;
