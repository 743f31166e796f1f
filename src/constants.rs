//! Global constants for mpih
//!
//! This module centralizes the protocol limits and tuning defaults used
//! across the daemon and the client commands. Collecting them in one place
//! keeps the daemon and its clients in agreement about the framing rules.

use std::time::Duration;

/// Maximum length of a client header line, newline included.
///
/// A connection whose first line grows past this limit without a newline is
/// closed as a protocol violation.
pub const MAX_HEADER_SIZE: usize = 256;

/// Maximum length of a daemon response line (`RANK`/`SIZE` replies) accepted
/// by the client side.
pub const MAX_RESPONSE_LINE: usize = 256;

/// Largest payload carried by a single wire chunk.
///
/// Streams longer than this are split into multiple (size, payload) frames.
/// The size travels as a 32-bit integer, so the hard ceiling is `i32::MAX`;
/// 64 KiB keeps per-chunk buffers small without hurting throughput.
pub const CHUNK_CAP: usize = 64 * 1024;

/// High-water mark for a single socket read into a connection's input
/// buffer.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024;

/// Cadence for polling transport completions and re-requesting a busy
/// channel.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Message tag shared by all streams. Channel exclusivity is what keeps
/// independent streams apart, not the tag.
pub const DEFAULT_TAG: i32 = 0;

/// How long `mpih run` waits for the spawned daemon to signal readiness
/// through its pid file.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable naming the daemon's Unix socket.
pub const ENV_SOCKET: &str = "MPIH_SOCKET";

/// Environment variable naming the daemon's pid file.
pub const ENV_PIDFILE: &str = "MPIH_PIDFILE";

/// Environment variable naming the daemon's log file.
pub const ENV_LOG: &str = "MPIH_LOG";

/// Environment variable carrying the job rank, set by `mpih run` for the
/// user script.
pub const ENV_RANK: &str = "MPIH_RANK";

/// Environment variable carrying the job size, set by `mpih run` for the
/// user script.
pub const ENV_SIZE: &str = "MPIH_SIZE";
