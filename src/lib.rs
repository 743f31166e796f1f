//! mpih: message passing for shell scripts on HPC clusters
//!
//! mpih lets plain shell scripts take part in a cluster-wide
//! message-passing job. Each rank runs one long-lived daemon
//! (`mpih init`); short-lived commands invoked from the script (`mpih
//! send`, `mpih recv`, `mpih rank`, `mpih size`, `mpih finalize`) connect
//! to the local daemon over a Unix domain socket, and the daemon relays
//! the byte streams between ranks:
//!
//! ```bash
//! #!/bin/bash
//! if [ "$MPIH_RANK" -eq 0 ]; then
//!     gzip -c data | mpih send 1
//! else
//!     mpih recv 0 | gunzip -c > data
//! fi
//! ```
//!
//! # Architecture
//!
//! - **Daemon core** ([`daemon`]): a single-threaded, event-driven
//!   multiplexer. Every client connection is an explicit state machine;
//!   a channel arbiter serializes access to each logical (direction,
//!   peer, tag) channel; streams cross the transport as bounded
//!   (size, payload) chunks with a zero-size end-of-stream marker; a
//!   finalize latch drains all transfers before shutdown.
//! - **Transport adapter** ([`transport`]): non-blocking, poll-completed
//!   peer messaging. MPI-backed on clusters (feature `mpi`), in-process
//!   loopback for single-rank jobs and tests.
//! - **Client side** ([`client`]): blocking socket operations behind the
//!   shell commands.
//! - **Process plumbing** ([`process`]): fork-based backgrounding that
//!   deliberately keeps the controlling terminal (the daemon dies with
//!   its shell), pid-file readiness, and the `mpih run` daemon launcher.
//!
//! # Example
//!
//! Running a daemon in-process over the loopback transport:
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use mpih::config::{DaemonConfig, LogTarget, Tuning};
//! use mpih::daemon::Daemon;
//! use mpih::transport::LoopbackFabric;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fabric = LoopbackFabric::new(1);
//! let config = DaemonConfig {
//!     socket_path: "/tmp/mpih.sock".into(),
//!     log: LogTarget::Disabled,
//!     pid_file: None,
//!     foreground: true,
//!     verbose: 0,
//!     tuning: Tuning::default(),
//! };
//! let daemon = Daemon::new(config, Rc::new(fabric.transport(0)))?;
//!
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_all()
//!     .build()?;
//! let local = tokio::task::LocalSet::new();
//! local.block_on(&rt, daemon.run())?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod logging;
pub mod process;
pub mod transport;
