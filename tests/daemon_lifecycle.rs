//! Integration tests for daemon lifecycle and protocol policing.
//!
//! Covers finalize (idle and with in-flight transfers), the fatal
//! header-after-finalize path, header length enforcement, and the
//! keep-open policy for malformed headers.

mod common;

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use mpih::client;
use mpih::daemon::DaemonError;

use common::{decode_stream, edge_frames, run_job, wait_listening};

// ============================================================================
// Finalize
// ============================================================================

#[test]
fn test_finalize_idle_daemon() {
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);
        client::finalize(&sockets[0]).unwrap();
    });

    assert!(outcome.results[0].is_ok());
    assert!(outcome.frames.is_empty());
}

#[test]
fn test_self_send_recv_single_rank() {
    // a single-rank job can still pipe a stream through itself
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);
        let s = sockets[0].clone();

        let sender =
            thread::spawn(move || client::send_stream(&s, 0, &mut &b"loop"[..]).unwrap());

        let mut out = Vec::new();
        client::recv_stream(&sockets[0], 0, &mut out).unwrap();
        assert_eq!(out, b"loop");
        sender.join().unwrap();

        client::finalize(&sockets[0]).unwrap();
    });

    assert!(outcome.results[0].is_ok());
}

#[test]
fn test_finalize_drains_inflight_stream() {
    let outcome = run_job(2, |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }

        // start a stream and leave it unfinished
        let mut sender = UnixStream::connect(&sockets[0]).unwrap();
        sender.write_all(b"SEND 1\n").unwrap();
        sender.write_all(&[b'x'; 1000]).unwrap();
        thread::sleep(Duration::from_millis(200));

        // finalize arrives while the stream is in flight; the daemon must
        // accept it and keep draining
        let s0 = sockets[0].clone();
        let finalizer = thread::spawn(move || client::finalize(&s0).unwrap());
        thread::sleep(Duration::from_millis(200));

        // the stream completes after the latch
        sender.write_all(&[b'y'; 1000]).unwrap();
        sender.shutdown(std::net::Shutdown::Write).unwrap();
        let mut sink = Vec::new();
        sender.read_to_end(&mut sink).unwrap();

        finalizer.join().unwrap();

        let mut out = Vec::new();
        client::recv_stream(&sockets[1], 0, &mut out).unwrap();
        assert_eq!(out.len(), 2000);
        assert!(out[..1000].iter().all(|&b| b == b'x'));
        assert!(out[1000..].iter().all(|&b| b == b'y'));

        client::finalize(&sockets[1]).unwrap();
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));

    // the drained stream still ends with its zero terminator
    let (sizes, payload) = decode_stream(&edge_frames(&outcome.frames, 0, 1));
    assert_eq!(payload.len(), 2000);
    assert_eq!(sizes.iter().sum::<usize>(), 2000);
}

#[test]
fn test_header_after_finalize_is_fatal() {
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);

        // an open SEND keeps the daemon from quiescing, holding it alive
        // past the finalize latch
        let mut pending = UnixStream::connect(&sockets[0]).unwrap();
        pending.write_all(b"SEND 0\n").unwrap();
        thread::sleep(Duration::from_millis(100));

        let s = sockets[0].clone();
        let finalizer = thread::spawn(move || {
            // the daemon dies before shutting this connection down
            // cleanly, so ignore the outcome
            let _ = client::finalize(&s);
        });
        thread::sleep(Duration::from_millis(100));

        // a straggling client after the latch is a script bug: the whole
        // daemon must terminate with a diagnostic
        let mut straggler = UnixStream::connect(&sockets[0]).unwrap();
        straggler.write_all(b"RANK\n").unwrap();
        let mut sink = Vec::new();
        let _ = straggler.read_to_end(&mut sink);

        drop(pending);
        finalizer.join().unwrap();
    });

    assert!(matches!(
        outcome.results[0],
        Err(DaemonError::ProtocolViolation(_))
    ));
}

// ============================================================================
// Header enforcement
// ============================================================================

#[test]
fn test_oversize_header_closes_connection() {
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);

        // 257 bytes with no newline exceeds the cap
        let mut stream = UnixStream::connect(&sockets[0]).unwrap();
        stream.write_all(&[b'A'; 257]).unwrap();

        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).unwrap();
        assert!(sink.is_empty(), "no reply on a rejected connection");

        // only the offending connection dies; the daemon keeps serving
        assert_eq!(client::query_rank(&sockets[0]).unwrap(), 0);
        client::finalize(&sockets[0]).unwrap();
    });

    assert!(outcome.results[0].is_ok());
}

#[test]
fn test_header_at_exact_cap_is_accepted() {
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);

        // "RANK" padded to exactly 256 bytes including the newline
        let mut line = b"RANK".to_vec();
        line.resize(255, b' ');
        line.push(b'\n');
        assert_eq!(line.len(), 256);

        let mut stream = UnixStream::connect(&sockets[0]).unwrap();
        stream.write_all(&line).unwrap();

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"0\n");
        drop(stream);

        client::finalize(&sockets[0]).unwrap();
    });

    assert!(outcome.results[0].is_ok());
}

#[test]
fn test_unknown_and_malformed_headers_keep_connection_open() {
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);

        let mut stream = UnixStream::connect(&sockets[0]).unwrap();
        // unknown verb, blank line, missing argument, non-numeric rank:
        // all logged, none close the connection
        stream.write_all(b"BOGUS\n").unwrap();
        stream.write_all(b"\n").unwrap();
        stream.write_all(b"SEND\n").unwrap();
        stream.write_all(b"RECV one\n").unwrap();
        stream.write_all(b"RANK\n").unwrap();

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"0\n");
        drop(stream);

        client::finalize(&sockets[0]).unwrap();
    });

    assert!(outcome.results[0].is_ok());
}
