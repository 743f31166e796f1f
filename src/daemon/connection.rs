//! Per-client connection state machine
//!
//! Each accepted client gets one `Connection`, driven by a single task on
//! the daemon's local executor. The connection reads a header line,
//! answers queries inline, and for `SEND`/`RECV` acquires the matching
//! channel and relays the stream between the local socket and the peer
//! transport in (size, payload) chunks, terminated by a zero-size chunk.
//!
//! Transport completions are discovered by polling at the configured
//! cadence; socket readiness comes from the runtime reactor. All
//! observable progress is recorded in [`ConnState`], which the daemon
//! context mirrors so the finalize coordinator can detect quiescence.

use std::io;
use std::rc::Rc;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, error, info, trace, warn};

use crate::daemon::arbiter::{Channel, ChannelRequest, Direction};
use crate::daemon::error::DaemonError;
use crate::daemon::server::DaemonContext;
use crate::transport::{OpHandle, TestResult, TransportError};

/// Connection state. Any state other than `ReadingHeader`, `FlushingSocket`,
/// `Finalizing` and `Closed` counts as a pending transfer for the finalize
/// coordinator's quiesce check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Awaiting a full header line on the input buffer.
    ReadingHeader,
    /// Requested channel is busy; re-request on the next poll tick.
    WaitingForChannel,
    /// Owns a SEND channel; may have input bytes to push.
    ReadyToSend,
    /// `isend` of a chunk's size is in flight.
    SendingSize,
    /// `isend` of a chunk body is in flight.
    SendingChunk,
    /// `isend` of the zero-size terminator is in flight.
    SendingEof,
    /// Owns a RECV channel; no receive posted yet.
    ReadyToRecvSize,
    /// `irecv` of the next chunk's size is in flight.
    RecvingSize,
    /// Size received; body receive not yet posted.
    ReadyToRecvChunk,
    /// `irecv` of a chunk body is in flight.
    RecvingChunk,
    /// End-of-stream received; draining output to the client.
    FlushingSocket,
    /// This connection issued FINALIZE; the loop is winding down.
    Finalizing,
    /// Terminal.
    Closed,
}

impl ConnState {
    /// Whether this state blocks finalize (a transfer is in flight, about
    /// to be posted, or waiting on a channel).
    pub fn transfer_pending(&self) -> bool {
        matches!(
            self,
            ConnState::WaitingForChannel
                | ConnState::ReadyToSend
                | ConnState::SendingSize
                | ConnState::SendingChunk
                | ConnState::SendingEof
                | ConnState::ReadyToRecvSize
                | ConnState::RecvingSize
                | ConnState::ReadyToRecvChunk
                | ConnState::RecvingChunk
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnState::ReadingHeader => "READING_HEADER",
            ConnState::WaitingForChannel => "WAITING_FOR_CHANNEL",
            ConnState::ReadyToSend => "READY_TO_SEND",
            ConnState::SendingSize => "SENDING_SIZE",
            ConnState::SendingChunk => "SENDING_CHUNK",
            ConnState::SendingEof => "SENDING_EOF",
            ConnState::ReadyToRecvSize => "READY_TO_RECV_SIZE",
            ConnState::RecvingSize => "RECVING_SIZE",
            ConnState::ReadyToRecvChunk => "READY_TO_RECV_CHUNK",
            ConnState::RecvingChunk => "RECVING_CHUNK",
            ConnState::FlushingSocket => "FLUSHING_SOCKET",
            ConnState::Finalizing => "FINALIZING",
            ConnState::Closed => "CLOSED",
        }
    }
}

/// Result of scanning the input buffer for a header line.
#[derive(Debug, PartialEq, Eq)]
enum LineStatus {
    /// A complete line, newline stripped.
    Line(String),
    /// No newline yet and the cap is not exceeded.
    Incomplete,
    /// The line grew past the cap before a newline arrived.
    Oversize,
}

/// Extract a `\n`-terminated line from the front of `input`, enforcing a
/// maximum line length (newline included).
fn extract_line(input: &mut Vec<u8>, cap: usize) -> LineStatus {
    match input.iter().position(|&b| b == b'\n') {
        Some(pos) if pos < cap => {
            let line: Vec<u8> = input.drain(..=pos).collect();
            LineStatus::Line(String::from_utf8_lossy(&line[..pos]).into_owned())
        }
        Some(_) => LineStatus::Oversize,
        None if input.len() > cap => LineStatus::Oversize,
        None => LineStatus::Incomplete,
    }
}

/// A parsed header line.
#[derive(Debug, PartialEq, Eq)]
enum HeaderCmd {
    Rank,
    Size,
    Send(i32),
    Recv(i32),
    Finalize,
    /// Blank or all-whitespace line; ignored.
    Empty,
    Malformed(String),
}

fn parse_header(line: &str) -> HeaderCmd {
    let mut tokens = line.split_whitespace();
    let Some(verb) = tokens.next() else {
        return HeaderCmd::Empty;
    };

    match verb {
        "RANK" => HeaderCmd::Rank,
        "SIZE" => HeaderCmd::Size,
        "FINALIZE" => HeaderCmd::Finalize,
        "SEND" | "RECV" => {
            let peer = tokens.next().and_then(|t| t.parse::<i32>().ok());
            match (peer, tokens.next()) {
                (Some(peer), None) => {
                    if verb == "SEND" {
                        HeaderCmd::Send(peer)
                    } else {
                        HeaderCmd::Recv(peer)
                    }
                }
                _ => HeaderCmd::Malformed(format!(
                    "malformed {} header, expected '{} <RANK>'",
                    verb, verb
                )),
            }
        }
        other => HeaderCmd::Malformed(format!("unrecognized header command '{}'", other)),
    }
}

/// One accepted client connection.
pub struct Connection {
    id: u64,
    ctx: Rc<DaemonContext>,
    stream: UnixStream,
    state: ConnState,
    /// Bytes read from the client, not yet consumed.
    input: Vec<u8>,
    /// Remote rank of the current stream.
    peer: i32,
    /// Channel lease for the current stream, if any.
    channel: Option<Channel>,
    holding_channel: bool,
    /// Chunk number currently being transferred.
    chunk_index: u64,
    /// Payload bytes fully transferred on the current stream.
    bytes_transferred: u64,
    /// Client closed its write half.
    eof: bool,
}

impl Connection {
    pub fn new(ctx: Rc<DaemonContext>, stream: UnixStream) -> Self {
        let id = ctx.alloc_conn_id();
        ctx.mirror_state(id, ConnState::ReadingHeader);
        Self {
            id,
            ctx,
            stream,
            state: ConnState::ReadingHeader,
            input: Vec::new(),
            peer: 0,
            channel: None,
            holding_channel: false,
            chunk_index: 0,
            bytes_transferred: 0,
            eof: false,
        }
    }

    /// Drive the connection to completion, then close it.
    pub async fn run(mut self) {
        info!("[{}] opened connection to client", self.id);

        if let Err(e) = self.drive().await {
            match &e {
                DaemonError::Io(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::UnexpectedEof
                    ) =>
                {
                    debug!("[{}] client went away: {}", self.id, err)
                }
                _ => error!("[{}] connection error: {}", self.id, e),
            }
        }

        self.close();
    }

    async fn drive(&mut self) -> Result<(), DaemonError> {
        loop {
            let Some(line) = self.next_header().await? else {
                // client closed (or oversize header); nothing more to do
                return Ok(());
            };

            if self.ctx.finalize_pending() {
                let msg = format!(
                    "a client attempted to issue commands after finalize: '{}'",
                    line
                );
                error!("[{}] {}", self.id, msg);
                self.ctx.fatal(msg);
                return Ok(());
            }

            debug!("[{}] received header line '{}'", self.id, line);

            match parse_header(&line) {
                HeaderCmd::Empty => continue,
                HeaderCmd::Malformed(msg) => {
                    // keep the connection open; the client may follow up
                    // with a valid header
                    error!("[{}] error: {}", self.id, msg);
                    continue;
                }
                HeaderCmd::Rank => {
                    let reply = format!("{}\n", self.ctx.rank());
                    self.stream.write_all(reply.as_bytes()).await?;
                }
                HeaderCmd::Size => {
                    let reply = format!("{}\n", self.ctx.size());
                    self.stream.write_all(reply.as_bytes()).await?;
                }
                HeaderCmd::Send(peer) => return self.run_send(peer).await,
                HeaderCmd::Recv(peer) => return self.run_recv(peer).await,
                HeaderCmd::Finalize => return self.run_finalize().await,
            }
        }
    }

    // ---- header phase -----------------------------------------------------

    /// Read until the input buffer holds a complete header line. Returns
    /// `None` when the client closed before completing one, or when the
    /// line exceeded the cap (connection is to be closed).
    async fn next_header(&mut self) -> Result<Option<String>, DaemonError> {
        let cap = self.ctx.tuning().max_header_size;
        loop {
            match extract_line(&mut self.input, cap) {
                LineStatus::Line(line) => return Ok(Some(line)),
                LineStatus::Oversize => {
                    error!(
                        "[{}] header line exceeded max length ({} bytes)",
                        self.id, cap
                    );
                    return Ok(None);
                }
                LineStatus::Incomplete => {
                    if self.eof {
                        return Ok(None);
                    }
                    self.read_more(cap + 1).await?;
                }
            }
        }
    }

    // ---- socket input -----------------------------------------------------

    /// Wait until at least one byte is read into the input buffer, or the
    /// client closes its write half (sets `eof`).
    async fn read_more(&mut self, cap: usize) -> Result<usize, DaemonError> {
        let high_water = self.ctx.tuning().read_high_water;
        let want = high_water.min(cap.saturating_sub(self.input.len()).max(1));
        let mut buf = vec![0u8; want];
        loop {
            self.stream.readable().await.map_err(DaemonError::Io)?;
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.input.extend_from_slice(&buf[..n]);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(DaemonError::Io(e)),
            }
        }
    }

    /// Opportunistically pull immediately-available bytes into the input
    /// buffer, up to `cap` buffered bytes. Never blocks.
    fn try_fill(&mut self, cap: usize) -> Result<usize, DaemonError> {
        let mut total = 0;
        let high_water = self.ctx.tuning().read_high_water;
        while !self.eof && self.input.len() < cap {
            let want = high_water.min(cap - self.input.len());
            let mut buf = vec![0u8; want];
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.input.extend_from_slice(&buf[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(DaemonError::Io(e)),
            }
        }
        Ok(total)
    }

    // ---- channel acquisition ----------------------------------------------

    async fn acquire_channel(&mut self, channel: Channel) -> Result<(), DaemonError> {
        self.channel = Some(channel);

        if self.ctx.request_channel(self.id, channel) == ChannelRequest::Queued {
            trace!("[{}] queued for channel {}", self.id, channel);
            self.set_state(ConnState::WaitingForChannel);
            loop {
                tokio::time::sleep(self.ctx.poll_interval()).await;
                if self.ctx.request_channel(self.id, channel) == ChannelRequest::Granted {
                    break;
                }
            }
        }

        self.holding_channel = true;
        trace!("[{}] granted channel {}", self.id, channel);
        Ok(())
    }

    // ---- streaming send (client -> peer) ----------------------------------

    async fn run_send(&mut self, peer: i32) -> Result<(), DaemonError> {
        self.peer = peer;
        self.acquire_channel(Channel {
            direction: Direction::Send,
            peer,
            tag: self.ctx.tag(),
        })
        .await?;
        self.set_state(ConnState::ReadyToSend);

        loop {
            self.fill_for_chunk().await?;

            if !self.input.is_empty() {
                self.send_chunk().await?;
            } else if self.eof {
                return self.send_eof().await;
            }
        }
    }

    /// Top up the input buffer for the next chunk: block until at least one
    /// byte (or EOF) is available, then greedily drain whatever the client
    /// has already written, up to one chunk.
    async fn fill_for_chunk(&mut self) -> Result<(), DaemonError> {
        let cap = self.ctx.tuning().chunk_cap;
        if self.input.is_empty() && !self.eof {
            self.read_more(cap).await?;
        }
        self.try_fill(cap)?;
        Ok(())
    }

    async fn send_chunk(&mut self) -> Result<(), DaemonError> {
        let cap = self.ctx.tuning().chunk_cap;
        let take = self.input.len().min(cap);
        let chunk: Vec<u8> = self.input.drain(..take).collect();
        let chunk_size = take as i32;

        debug!(
            "[{}] sending chunk #{} to rank {} ({} bytes)",
            self.id, self.chunk_index, self.peer, chunk_size
        );

        // the size is posted first; per-channel FIFO guarantees the peer
        // sees size-then-body
        self.set_state(ConnState::SendingSize);
        let tag = self.ctx.tag();
        let size_handle = self
            .ctx
            .transport()
            .isend(self.peer, tag, chunk_size.to_ne_bytes().to_vec())?;
        let body_handle = match self.ctx.transport().isend(self.peer, tag, chunk) {
            Ok(handle) => handle,
            Err(e) => {
                self.drain_op(size_handle).await;
                return Err(e.into());
            }
        };
        self.set_state(ConnState::SendingChunk);

        let size_result = self.await_op(size_handle).await;
        let body_result = self.await_op(body_handle).await;
        size_result?;
        body_result?;

        self.chunk_index += 1;
        self.bytes_transferred += take as u64;
        trace!(
            "[{}] sent {} bytes to rank {} so far",
            self.id,
            self.bytes_transferred,
            self.peer
        );

        self.set_state(ConnState::ReadyToSend);
        Ok(())
    }

    async fn send_eof(&mut self) -> Result<(), DaemonError> {
        info!(
            "[{}] send to rank {} complete ({} bytes), sending EOF",
            self.id, self.peer, self.bytes_transferred
        );

        self.set_state(ConnState::SendingEof);
        let handle = self
            .ctx
            .transport()
            .isend(self.peer, self.ctx.tag(), 0i32.to_ne_bytes().to_vec())?;
        self.await_op(handle).await?;
        Ok(())
    }

    // ---- streaming recv (peer -> client) ----------------------------------

    async fn run_recv(&mut self, peer: i32) -> Result<(), DaemonError> {
        self.peer = peer;
        self.acquire_channel(Channel {
            direction: Direction::Recv,
            peer,
            tag: self.ctx.tag(),
        })
        .await?;

        loop {
            self.set_state(ConnState::ReadyToRecvSize);
            trace!(
                "[{}] receiving size for chunk #{} from rank {}",
                self.id,
                self.chunk_index,
                peer
            );
            let handle = self.ctx.transport().irecv(peer, self.ctx.tag(), 4)?;
            self.set_state(ConnState::RecvingSize);
            let size_bytes = self.await_op(handle).await?;
            let chunk_size = decode_chunk_size(&size_bytes)
                .map_err(|msg| DaemonError::Io(io::Error::new(io::ErrorKind::InvalidData, msg)))?;
            self.chunk_index += 1;

            if chunk_size == 0 {
                debug!("[{}] received EOF from rank {}", self.id, peer);
                return self.flush_and_finish().await;
            }

            self.set_state(ConnState::ReadyToRecvChunk);
            debug!(
                "[{}] receiving chunk #{} from rank {} ({} bytes)",
                self.id, self.chunk_index, peer, chunk_size
            );
            let handle = self
                .ctx
                .transport()
                .irecv(peer, self.ctx.tag(), chunk_size as usize)?;
            self.set_state(ConnState::RecvingChunk);
            let data = self.await_op(handle).await?;
            debug_assert_eq!(data.len(), chunk_size as usize);

            self.bytes_transferred += data.len() as u64;
            trace!(
                "[{}] received {} bytes from rank {} so far",
                self.id,
                self.bytes_transferred,
                peer
            );

            // writing to the client applies output backpressure: the next
            // receive is not posted until the client accepted this chunk
            self.stream.write_all(&data).await?;
        }
    }

    async fn flush_and_finish(&mut self) -> Result<(), DaemonError> {
        self.set_state(ConnState::FlushingSocket);
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    // ---- finalize ---------------------------------------------------------

    async fn run_finalize(&mut self) -> Result<(), DaemonError> {
        info!("[{}] preparing to shut down daemon...", self.id);
        self.ctx.latch_finalize();
        self.set_state(ConnState::Finalizing);

        while self.ctx.transfer_ops_pending() {
            trace!(
                "[{}] waiting for pending transfers to complete",
                self.id
            );
            tokio::time::sleep(self.ctx.poll_interval()).await;
        }

        info!(
            "[{}] pending transfers complete, shutting down",
            self.id
        );
        self.ctx.request_shutdown();
        Ok(())
    }

    // ---- transport polling ------------------------------------------------

    /// Poll an in-flight operation to completion at the configured cadence.
    /// While a send is in flight, immediately-available client bytes keep
    /// flowing into the input buffer so back-to-back chunks stay full.
    async fn await_op(&mut self, mut handle: OpHandle) -> Result<Vec<u8>, DaemonError> {
        loop {
            match self.ctx.transport().test(handle)? {
                TestResult::Done(data) => return Ok(data),
                TestResult::Pending(h) => handle = h,
            }

            if matches!(
                self.state,
                ConnState::SendingSize | ConnState::SendingChunk
            ) {
                let cap = self.ctx.tuning().chunk_cap;
                self.try_fill(cap)?;
            }

            tokio::time::sleep(self.ctx.poll_interval()).await;
        }
    }

    /// Poll an operation to completion, discarding the outcome. Used on
    /// error paths so no handle outlives the connection.
    async fn drain_op(&mut self, mut handle: OpHandle) {
        loop {
            match self.ctx.transport().test(handle) {
                Ok(TestResult::Done(_)) | Err(TransportError::UnknownHandle(_)) => return,
                Ok(TestResult::Pending(h)) => handle = h,
                Err(e) => {
                    warn!("[{}] error draining in-flight operation: {}", self.id, e);
                    return;
                }
            }
            tokio::time::sleep(self.ctx.poll_interval()).await;
        }
    }

    // ---- teardown ---------------------------------------------------------

    fn set_state(&mut self, state: ConnState) {
        trace!(
            "[{}] state {} -> {}",
            self.id,
            self.state.name(),
            state.name()
        );
        self.state = state;
        self.ctx.mirror_state(self.id, state);
    }

    /// Close the connection: release any held channel, mark CLOSED, and
    /// drop out of the daemon's registry. Idempotent.
    pub(crate) fn close(&mut self) {
        if matches!(self.state, ConnState::Closed) {
            return;
        }
        if self.holding_channel {
            if let Some(channel) = self.channel {
                trace!("[{}] releasing channel {}", self.id, channel);
                self.ctx.release_channel(self.id, channel);
            }
            self.holding_channel = false;
        }
        self.state = ConnState::Closed;
        self.ctx.unregister(self.id);
        info!("[{}] closing connection", self.id);
        // the socket itself closes when the connection is dropped
    }
}

fn decode_chunk_size(bytes: &[u8]) -> Result<i32, String> {
    if bytes.len() != 4 {
        return Err(format!(
            "chunk size message has {} bytes, expected 4",
            bytes.len()
        ));
    }
    let size = i32::from_ne_bytes(bytes.try_into().unwrap());
    if size < 0 {
        return Err(format!("negative chunk size {}", size));
    }
    Ok(size)
}
