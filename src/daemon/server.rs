//! Daemon server: listener, shared context, and shutdown coordination
//!
//! [`DaemonContext`] is the single injected collaborator every connection
//! receives: the transport, the channel arbiter, the finalize latch, and a
//! mirror of each live connection's state for the quiesce check. The
//! daemon runs on a current-thread runtime, so everything in the context
//! is `Rc`/`RefCell`: one thread of control, no locks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, Tuning};
use crate::constants::DEFAULT_TAG;
use crate::daemon::arbiter::{Channel, ChannelArbiter, ChannelRequest};
use crate::daemon::connection::{ConnState, Connection};
use crate::daemon::error::DaemonError;
use crate::transport::Transport;

/// Shared state of one daemon instance, handed to every connection.
pub struct DaemonContext {
    transport: Rc<dyn Transport>,
    tuning: Tuning,
    arbiter: RefCell<ChannelArbiter>,
    /// Live connections and their last observed state.
    states: RefCell<HashMap<u64, ConnState>>,
    next_conn_id: Cell<u64>,
    /// Once set, any further header is a fatal protocol violation.
    finalize_pending: Cell<bool>,
    /// Diagnostic of a fatal violation, reported as the daemon's result.
    fatal: RefCell<Option<String>>,
    shutdown: Notify,
}

impl DaemonContext {
    pub fn new(transport: Rc<dyn Transport>, tuning: Tuning) -> Self {
        Self {
            transport,
            tuning,
            arbiter: RefCell::new(ChannelArbiter::new()),
            states: RefCell::new(HashMap::new()),
            next_conn_id: Cell::new(0),
            finalize_pending: Cell::new(false),
            fatal: RefCell::new(None),
            shutdown: Notify::new(),
        }
    }

    pub fn rank(&self) -> i32 {
        self.transport.rank()
    }

    pub fn size(&self) -> i32 {
        self.transport.size()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn tag(&self) -> i32 {
        DEFAULT_TAG
    }

    pub fn poll_interval(&self) -> Duration {
        self.tuning.poll_interval()
    }

    pub(crate) fn alloc_conn_id(&self) -> u64 {
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id.wrapping_add(1));
        id
    }

    pub(crate) fn mirror_state(&self, conn_id: u64, state: ConnState) {
        self.states.borrow_mut().insert(conn_id, state);
    }

    pub(crate) fn unregister(&self, conn_id: u64) {
        self.states.borrow_mut().remove(&conn_id);
    }

    /// True while any connection is in a transfer-in-flight or
    /// channel-waiting state. The finalize coordinator exits only once
    /// this goes false.
    pub fn transfer_ops_pending(&self) -> bool {
        self.states
            .borrow()
            .values()
            .any(|state| state.transfer_pending())
    }

    pub(crate) fn request_channel(&self, conn_id: u64, channel: Channel) -> ChannelRequest {
        self.arbiter.borrow_mut().request(conn_id, channel)
    }

    pub(crate) fn release_channel(&self, conn_id: u64, channel: Channel) {
        self.arbiter.borrow_mut().release(conn_id, channel)
    }

    pub fn latch_finalize(&self) {
        self.finalize_pending.set(true);
    }

    pub fn finalize_pending(&self) -> bool {
        self.finalize_pending.get()
    }

    /// Record a fatal protocol violation and stop the loop. The daemon
    /// reports the diagnostic and exits non-zero.
    pub(crate) fn fatal(&self, msg: String) {
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() {
            *fatal = Some(msg);
        }
        drop(fatal);
        self.shutdown.notify_one();
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// One daemon instance: a bound listener plus its context.
pub struct Daemon {
    config: DaemonConfig,
    ctx: Rc<DaemonContext>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, transport: Rc<dyn Transport>) -> Result<Self, DaemonError> {
        config.validate()?;
        let ctx = Rc::new(DaemonContext::new(transport, config.tuning.clone()));
        Ok(Self { config, ctx })
    }

    pub fn context(&self) -> Rc<DaemonContext> {
        Rc::clone(&self.ctx)
    }

    /// Run the daemon until a client finalizes it (or a fatal protocol
    /// violation stops it). Must be called from within a `LocalSet`.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let socket_path = &self.config.socket_path;
        let listener = bind_socket(socket_path)?;
        info!(
            "daemon for rank {}/{} listening on {}",
            self.ctx.rank(),
            self.ctx.size(),
            socket_path.display()
        );

        // the pid file doubles as the readiness signal: it appears only
        // after the listener is bound
        if let Some(pid_file) = &self.config.pid_file {
            crate::process::write_pid_file(pid_file)?;
        }

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let conn = Connection::new(self.ctx.clone(), stream);
                        tokio::task::spawn_local(conn.run());
                    }
                    Err(e) => warn!("accept error: {}", e),
                },
            }
        }

        self.cleanup();

        if let Some(msg) = self.ctx.fatal.borrow_mut().take() {
            error!("shutting down after protocol violation: {}", msg);
            // no transport finalize here: peers may be mid-transfer and a
            // collective shutdown would hang
            return Err(DaemonError::ProtocolViolation(msg));
        }

        self.ctx.transport.finalize();
        info!("daemon shut down cleanly");
        Ok(())
    }

    fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "failed to remove socket {}: {}",
                    self.config.socket_path.display(),
                    e
                );
            }
        }
        if let Some(pid_file) = &self.config.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
    }
}

/// Bind the listener socket, replacing a stale socket file if present.
fn bind_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| DaemonError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
    }
    UnixListener::bind(path).map_err(|source| DaemonError::Bind {
        path: path.to_path_buf(),
        source,
    })
}
