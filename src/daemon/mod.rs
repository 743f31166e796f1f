//! The mpih daemon core
//!
//! One daemon runs per job rank. Shell clients connect over a Unix domain
//! socket, and the daemon bridges their byte streams to and from peer
//! daemons through the job transport:
//!
//! ```text
//! ┌──────────┐  ┌──────────┐  ┌──────────┐
//! │mpih send │  │mpih recv │  │mpih rank │   (shell clients)
//! └────┬─────┘  └────┬─────┘  └────┬─────┘
//!      │             │             │
//!      └─────────────┼─────────────┘
//!                    │ Unix domain socket
//!                    ▼
//! ┌─────────────────────────────────────────┐
//! │           mpih init daemon              │
//! │  connections → channel arbiter →        │
//! │  transport (chunked, zero-terminated)   │──── peer daemons
//! └─────────────────────────────────────────┘
//! ```
//!
//! The daemon is a single-threaded, event-driven multiplexer:
//!
//! - every accepted client becomes a [`Connection`] with an explicit state
//!   machine ([`ConnState`]);
//! - the [`ChannelArbiter`] makes each logical (direction, peer, tag)
//!   channel single-owner so concurrent clients cannot intermingle
//!   streams;
//! - streams cross the transport as (size, payload) chunks terminated by a
//!   zero size;
//! - a `FINALIZE` client latches the shutdown flag, waits for all
//!   transfers to drain, and stops the loop.

pub mod arbiter;
pub mod connection;
pub mod error;
pub mod server;

pub use arbiter::{Channel, ChannelArbiter, ChannelRequest, Direction};
pub use connection::{ConnState, Connection};
pub use error::DaemonError;
pub use server::{Daemon, DaemonContext};
