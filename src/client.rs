//! Client-side operations on the daemon socket
//!
//! These are the blocking building blocks behind the `mpih` subcommands:
//! connect to the local daemon, issue one header, and move bytes. Clients
//! are short-lived and sequential, so plain `std` sockets are all that is
//! needed; the asynchrony lives in the daemon.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use crate::constants::MAX_RESPONSE_LINE;

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to daemon at `{path}`: {source}")]
    Connect { path: String, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected daemon response: {0}")]
    Protocol(String),
}

/// Connect to the daemon socket.
pub fn connect(socket: &Path) -> Result<UnixStream, ClientError> {
    debug!("connecting to daemon at {}", socket.display());
    UnixStream::connect(socket).map_err(|source| ClientError::Connect {
        path: socket.display().to_string(),
        source,
    })
}

/// Query the daemon's rank.
pub fn query_rank(socket: &Path) -> Result<i32, ClientError> {
    let line = query_line(socket, "RANK\n")?;
    parse_reply(&line)
}

/// Query the job size.
pub fn query_size(socket: &Path) -> Result<i32, ClientError> {
    let line = query_line(socket, "SIZE\n")?;
    parse_reply(&line)
}

/// Stream `reader` to `peer` through the daemon. Returns the number of
/// payload bytes sent. Blocks until the daemon has fully relayed the
/// stream (it closes the connection after the end-of-stream marker).
pub fn send_stream(
    socket: &Path,
    peer: i32,
    reader: &mut dyn Read,
) -> Result<u64, ClientError> {
    let mut stream = connect(socket)?;
    stream.write_all(format!("SEND {}\n", peer).as_bytes())?;

    let bytes = io::copy(reader, &mut stream)?;

    // half-close tells the daemon the stream is complete; the daemon
    // closes once the terminator is on the wire
    stream.shutdown(Shutdown::Write)?;
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink)?;
    if !sink.is_empty() {
        return Err(ClientError::Protocol(format!(
            "daemon sent {} unexpected bytes on a SEND connection",
            sink.len()
        )));
    }

    debug!("sent {} bytes to rank {}", bytes, peer);
    Ok(bytes)
}

/// Stream bytes arriving from `peer` into `writer` until end-of-stream.
/// Returns the number of payload bytes received.
pub fn recv_stream(
    socket: &Path,
    peer: i32,
    writer: &mut dyn Write,
) -> Result<u64, ClientError> {
    let mut stream = connect(socket)?;
    stream.write_all(format!("RECV {}\n", peer).as_bytes())?;

    let bytes = io::copy(&mut stream, writer)?;
    writer.flush()?;

    debug!("received {} bytes from rank {}", bytes, peer);
    Ok(bytes)
}

/// Ask the daemon to shut down, and wait until it has.
pub fn finalize(socket: &Path) -> Result<(), ClientError> {
    let mut stream = connect(socket)?;
    stream.write_all(b"FINALIZE\n")?;

    // the daemon closes this connection once shutdown completes
    let mut sink = Vec::new();
    stream.read_to_end(&mut sink)?;
    Ok(())
}

/// Issue a query header and read the single-line reply.
fn query_line(socket: &Path, header: &str) -> Result<String, ClientError> {
    let mut stream = connect(socket)?;
    stream.write_all(header.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte)? {
            0 => break,
            _ => {
                if byte[0] == b'\n' {
                    return Ok(String::from_utf8_lossy(&response).into_owned());
                }
                response.push(byte[0]);
                if response.len() >= MAX_RESPONSE_LINE {
                    return Err(ClientError::Protocol(format!(
                        "response line exceeded max length ({} bytes)",
                        MAX_RESPONSE_LINE
                    )));
                }
            }
        }
    }
    Err(ClientError::Protocol(
        "daemon closed the connection before replying".to_string(),
    ))
}

fn parse_reply(line: &str) -> Result<i32, ClientError> {
    line.trim()
        .parse::<i32>()
        .map_err(|_| ClientError::Protocol(format!("expected an integer, got '{}'", line)))
}
