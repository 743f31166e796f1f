//! In-process loopback transport
//!
//! Connects the transports of all ranks of a job through per-edge FIFO
//! queues inside one process. This is the transport behind single-rank
//! `mpih` jobs built without MPI support, and it lets the test suite run
//! multi-rank daemons on one thread with no launcher.
//!
//! Sends complete eagerly (the fabric buffers every message); receives
//! complete once a message is queued on the matching edge. Message order
//! per (source, destination, tag) edge is FIFO, matching the ordering
//! contract of the real transport.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{check_peer, OpHandle, TestResult, Transport, TransportError};

/// One recorded wire message, kept so tests can assert on framing.
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: i32,
    pub dest: i32,
    pub tag: i32,
    pub data: Vec<u8>,
}

/// Message queues shared by every rank of an in-process job.
#[derive(Default)]
struct Fabric {
    /// (source, dest, tag) -> queued messages, FIFO.
    queues: HashMap<(i32, i32, i32), VecDeque<Vec<u8>>>,
    /// Every message ever posted, in post order.
    frames: Vec<Frame>,
}

/// Handle to an in-process job fabric; clones share the same queues.
#[derive(Clone)]
pub struct LoopbackFabric {
    size: i32,
    inner: Rc<RefCell<Fabric>>,
}

impl LoopbackFabric {
    pub fn new(size: i32) -> Self {
        assert!(size > 0, "job size must be positive");
        Self {
            size,
            inner: Rc::new(RefCell::new(Fabric::default())),
        }
    }

    /// Create the transport endpoint for `rank`.
    pub fn transport(&self, rank: i32) -> LoopbackTransport {
        assert!(rank >= 0 && rank < self.size, "rank out of range");
        LoopbackTransport {
            rank,
            size: self.size,
            fabric: Rc::clone(&self.inner),
            ops: RefCell::new(HashMap::new()),
            next_op: Cell::new(1),
        }
    }

    /// Snapshot of every message posted so far, in post order.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.borrow().frames.clone()
    }
}

enum Op {
    /// Eagerly completed send holding the caller's buffer until tested.
    Send(Vec<u8>),
    /// Receive waiting for a message on its edge.
    Recv { source: i32, tag: i32, cap: usize },
}

/// Transport endpoint of one rank on a [`LoopbackFabric`].
pub struct LoopbackTransport {
    rank: i32,
    size: i32,
    fabric: Rc<RefCell<Fabric>>,
    ops: RefCell<HashMap<u64, Op>>,
    next_op: Cell<u64>,
}

impl LoopbackTransport {
    fn alloc_handle(&self, op: Op) -> OpHandle {
        let id = self.next_op.get();
        self.next_op.set(id + 1);
        self.ops.borrow_mut().insert(id, op);
        OpHandle(id)
    }
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn isend(&self, peer: i32, tag: i32, data: Vec<u8>) -> Result<OpHandle, TransportError> {
        check_peer(peer, self.size)?;

        let mut fabric = self.fabric.borrow_mut();
        fabric.frames.push(Frame {
            source: self.rank,
            dest: peer,
            tag,
            data: data.clone(),
        });
        fabric
            .queues
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(data.clone());
        drop(fabric);

        Ok(self.alloc_handle(Op::Send(data)))
    }

    fn irecv(&self, peer: i32, tag: i32, len: usize) -> Result<OpHandle, TransportError> {
        check_peer(peer, self.size)?;
        Ok(self.alloc_handle(Op::Recv {
            source: peer,
            tag,
            cap: len,
        }))
    }

    fn test(&self, handle: OpHandle) -> Result<TestResult, TransportError> {
        let mut ops = self.ops.borrow_mut();
        let op = ops.remove(&handle.0).ok_or(TransportError::UnknownHandle(handle.0))?;

        match op {
            Op::Send(data) => Ok(TestResult::Done(data)),
            Op::Recv { source, tag, cap } => {
                let mut fabric = self.fabric.borrow_mut();
                let queue = fabric.queues.entry((source, self.rank, tag)).or_default();
                match queue.pop_front() {
                    Some(mut data) => {
                        data.truncate(cap);
                        Ok(TestResult::Done(data))
                    }
                    None => {
                        drop(fabric);
                        ops.insert(handle.0, Op::Recv { source, tag, cap });
                        Ok(TestResult::Pending(handle))
                    }
                }
            }
        }
    }

    fn finalize(&self) {}
}
