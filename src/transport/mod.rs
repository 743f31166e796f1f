//! Transport adapter for non-blocking peer messaging
//!
//! The daemon never talks to the messaging library directly; it goes
//! through the [`Transport`] trait, which exposes exactly what the core
//! needs: rank identity, non-blocking send/receive that take ownership of
//! their buffers, and a consume-or-return completion test. Completion is
//! discovered by polling; the daemon's event loop schedules the polls.
//!
//! Two implementations exist: [`loopback`] wires transports together inside
//! one process (single-rank jobs and the test suite), and [`mpi`] bridges
//! real cluster ranks (feature `mpi`).

pub mod loopback;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use loopback::{Frame, LoopbackFabric, LoopbackTransport};

#[cfg(feature = "mpi")]
pub use mpi::MpiTransport;

/// Identifies one in-flight non-blocking operation.
///
/// Handles are affine: [`Transport::test`] consumes the handle and returns
/// it only while the operation is still pending.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct OpHandle(pub(crate) u64);

/// Outcome of polling an in-flight operation.
#[derive(Debug)]
pub enum TestResult {
    /// Still in flight; the handle is handed back for the next poll.
    Pending(OpHandle),
    /// Completed. For receives this is the received payload (truncated to
    /// the actual count); for sends it is the drained buffer, returned to
    /// the caller now that the transport no longer needs it.
    Done(Vec<u8>),
}

/// Errors surfaced by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport initialization failed: {0}")]
    Init(String),

    #[error("peer rank {peer} out of range for job size {size}")]
    PeerOutOfRange { peer: i32, size: i32 },

    #[error("unknown operation handle {0}")]
    UnknownHandle(u64),

    #[error("{0}")]
    Backend(String),
}

/// Non-blocking, poll-completed peer messaging.
///
/// Implementations guarantee FIFO delivery between any two operations on
/// the same (direction, peer, tag) triple posted by the same owner; the
/// channel arbiter extends that guarantee across independent owners.
pub trait Transport {
    /// Rank of this endpoint within the job.
    fn rank(&self) -> i32;

    /// Number of ranks in the job.
    fn size(&self) -> i32;

    /// Post a non-blocking send. The transport owns `data` until the
    /// operation tests as done.
    fn isend(&self, peer: i32, tag: i32, data: Vec<u8>) -> Result<OpHandle, TransportError>;

    /// Post a non-blocking receive of up to `len` bytes.
    fn irecv(&self, peer: i32, tag: i32, len: usize) -> Result<OpHandle, TransportError>;

    /// Poll an operation for completion. Side-effect-free while pending.
    fn test(&self, handle: OpHandle) -> Result<TestResult, TransportError>;

    /// Shut the transport down. Called exactly once, after the daemon has
    /// quiesced.
    fn finalize(&self);
}

/// Check a peer rank against the job size.
pub(crate) fn check_peer(peer: i32, size: i32) -> Result<(), TransportError> {
    if peer < 0 || peer >= size {
        return Err(TransportError::PeerOutOfRange { peer, size });
    }
    Ok(())
}
