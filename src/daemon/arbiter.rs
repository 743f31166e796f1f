//! Channel arbiter
//!
//! A *channel* is a (direction, peer rank, tag) triple, the unit of
//! exclusive access to the peer wire. The arbiter makes every channel
//! single-owner at any instant so that two clients streaming to the same
//! peer cannot intermingle their bytes:
//!
//! ```bash
//! if [ "$MPIH_RANK" -eq 0 ]; then
//!     echo "message 1" | mpih send 1 &
//!     echo "message 2" | mpih send 1 &
//! else
//!     mpih recv 0 | cat &
//!     mpih recv 0 | cat &
//! fi
//! ```
//!
//! Without arbitration the two sends above would interleave
//! unpredictably. With it, the second send waits until the first releases
//! the channel; pairing is strict arrival order.

use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Transfer direction of a channel, from the owning daemon's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "SEND"),
            Direction::Recv => write!(f, "RECV"),
        }
    }
}

/// A logical point-to-point channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub direction: Direction,
    pub peer: i32,
    pub tag: i32,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.direction, self.peer, self.tag)
    }
}

/// Outcome of a channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRequest {
    /// The requester is now (or already was) the channel owner.
    Granted,
    /// The channel is busy; the requester is queued and should re-request
    /// on its next poll.
    Queued,
}

/// Serializes ownership of channels across connections.
///
/// Fairness is strict FIFO: grants happen in first-request order, and a
/// queued connection keeps its position across re-requests.
#[derive(Debug, Default)]
pub struct ChannelArbiter {
    /// channel -> connection ids owning or waiting, head = owner.
    channels: HashMap<Channel, VecDeque<u64>>,
}

impl ChannelArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request ownership of a channel.
    pub fn request(&mut self, conn_id: u64, channel: Channel) -> ChannelRequest {
        let queue = self.channels.entry(channel).or_default();

        if queue.is_empty() {
            queue.push_back(conn_id);
            return ChannelRequest::Granted;
        }
        if *queue.front().unwrap() == conn_id {
            return ChannelRequest::Granted;
        }
        if !queue.contains(&conn_id) {
            queue.push_back(conn_id);
        }
        ChannelRequest::Queued
    }

    /// Release ownership of a channel. The caller must be the current
    /// owner; anything else is a daemon bug.
    pub fn release(&mut self, conn_id: u64, channel: Channel) {
        let queue = self
            .channels
            .get_mut(&channel)
            .unwrap_or_else(|| panic!("release of unknown channel {}", channel));
        assert_eq!(
            queue.front().copied(),
            Some(conn_id),
            "connection {} released channel {} it does not own",
            conn_id,
            channel
        );
        queue.pop_front();
        if queue.is_empty() {
            self.channels.remove(&channel);
        }
        // the next connection in the queue discovers its promotion by
        // re-requesting on its next poll tick
    }

    /// Number of channels with a live owner or waiters.
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }
}
