//! MPI transport (feature `mpi`)
//!
//! Bridges the daemon to the other ranks of the job through rsmpi's
//! immediate (non-blocking) operations. Buffers handed to [`isend`]/
//! [`irecv`] are moved onto the heap and leaked for the duration of the
//! operation so the request can live on [`StaticScope`]; they are reclaimed
//! when the operation tests as done.
//!
//! [`isend`]: super::Transport::isend
//! [`irecv`]: super::Transport::irecv

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use mpi::environment::Universe;
use mpi::request::{Request, StaticScope};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{check_peer, OpHandle, TestResult, Transport, TransportError};

struct Inflight {
    req: Request<'static, [u8], StaticScope>,
    /// Leaked operation buffer, reclaimed on completion.
    buf: *mut [u8],
    is_recv: bool,
}

/// Transport endpoint backed by the process's MPI world communicator.
pub struct MpiTransport {
    universe: RefCell<Option<Universe>>,
    world: SimpleCommunicator,
    rank: i32,
    size: i32,
    ops: RefCell<HashMap<u64, Inflight>>,
    next_op: Cell<u64>,
}

impl MpiTransport {
    /// Initialize MPI for this process. Fails if MPI is already
    /// initialized (the transport must be the sole owner of the library).
    pub fn new() -> Result<Self, TransportError> {
        let universe = mpi::initialize().ok_or_else(|| {
            TransportError::Init("MPI is already initialized in this process".to_string())
        })?;
        let world = universe.world();
        let rank = world.rank();
        let size = world.size();

        Ok(Self {
            universe: RefCell::new(Some(universe)),
            world,
            rank,
            size,
            ops: RefCell::new(HashMap::new()),
            next_op: Cell::new(1),
        })
    }

    fn track(&self, inflight: Inflight) -> OpHandle {
        let id = self.next_op.get();
        self.next_op.set(id + 1);
        self.ops.borrow_mut().insert(id, inflight);
        OpHandle(id)
    }
}

impl Transport for MpiTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn isend(&self, peer: i32, tag: i32, data: Vec<u8>) -> Result<OpHandle, TransportError> {
        check_peer(peer, self.size)?;

        let leaked: &'static mut [u8] = Box::leak(data.into_boxed_slice());
        let ptr = leaked as *mut [u8];
        // reborrow immutably for the request; `ptr` is the sole owner and
        // is only dereferenced again after the request completes
        let buf: &'static [u8] = unsafe { &*ptr };

        let req = self
            .world
            .process_at_rank(peer)
            .immediate_send_with_tag(StaticScope, buf, tag);

        Ok(self.track(Inflight {
            req,
            buf: ptr,
            is_recv: false,
        }))
    }

    fn irecv(&self, peer: i32, tag: i32, len: usize) -> Result<OpHandle, TransportError> {
        check_peer(peer, self.size)?;

        let leaked: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        let ptr = leaked as *mut [u8];
        let buf: &'static mut [u8] = unsafe { &mut *ptr };

        let req = self
            .world
            .process_at_rank(peer)
            .immediate_receive_into_with_tag(StaticScope, buf, tag);

        Ok(self.track(Inflight {
            req,
            buf: ptr,
            is_recv: true,
        }))
    }

    fn test(&self, handle: OpHandle) -> Result<TestResult, TransportError> {
        let mut ops = self.ops.borrow_mut();
        let inflight = ops
            .remove(&handle.0)
            .ok_or(TransportError::UnknownHandle(handle.0))?;

        match inflight.req.test() {
            Ok(status) => {
                let mut data = unsafe { Box::from_raw(inflight.buf) }.into_vec();
                if inflight.is_recv {
                    // a send status carries no meaningful count
                    let count = status.count(u8::equivalent_datatype()).max(0) as usize;
                    if count < data.len() {
                        data.truncate(count);
                    }
                }
                Ok(TestResult::Done(data))
            }
            Err(req) => {
                ops.insert(
                    handle.0,
                    Inflight {
                        req,
                        buf: inflight.buf,
                        is_recv: inflight.is_recv,
                    },
                );
                Ok(TestResult::Pending(handle))
            }
        }
    }

    fn finalize(&self) {
        debug_assert!(
            self.ops.borrow().is_empty(),
            "transport finalized with operations still in flight"
        );
        // dropping the universe runs MPI_Finalize
        self.universe.borrow_mut().take();
    }
}
