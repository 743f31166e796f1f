//! Integration tests for stream relaying between ranks.
//!
//! These run complete in-process jobs: one daemon per rank over the
//! loopback fabric, with real Unix-socket clients on worker threads. They
//! verify:
//! - RANK/SIZE query responses
//! - short, zero-byte and multi-chunk stream round trips
//! - wire framing (size-payload alternation, zero terminator, chunk cap)
//! - channel queueing fairness between concurrent clients

mod common;

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use mpih::client;
use mpih::constants::CHUNK_CAP;

use common::{decode_stream, edge_frames, run_job, wait_listening};

// ============================================================================
// Query headers
// ============================================================================

#[test]
fn test_rank_and_size_echo() {
    let outcome = run_job(2, |sockets| {
        for (rank, socket) in sockets.iter().enumerate() {
            wait_listening(socket);
            assert_eq!(client::query_rank(socket).unwrap(), rank as i32);
            assert_eq!(client::query_size(socket).unwrap(), 2);
        }
        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));
    // queries never touch the peer wire
    assert!(outcome.frames.is_empty());
}

#[test]
fn test_rank_reply_then_eof() {
    let outcome = run_job(1, |sockets| {
        wait_listening(&sockets[0]);

        let mut stream = UnixStream::connect(&sockets[0]).unwrap();
        stream.write_all(b"RANK\n").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "0\n");

        client::finalize(&sockets[0]).unwrap();
    });

    assert!(outcome.results[0].is_ok());
}

#[test]
fn test_multiple_queries_on_one_connection() {
    let outcome = run_job(2, |sockets| {
        wait_listening(&sockets[1]);

        let mut stream = UnixStream::connect(&sockets[1]).unwrap();
        stream.write_all(b"RANK\nSIZE\n").unwrap();

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"1\n2\n");
        drop(stream);

        wait_listening(&sockets[0]);
        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));
}

// ============================================================================
// Stream round trips
// ============================================================================

#[test]
fn test_short_send_recv() {
    let outcome = run_job(2, |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }
        let s0 = sockets[0].clone();
        let s1 = sockets[1].clone();

        let sender = thread::spawn(move || {
            client::send_stream(&s0, 1, &mut &b"hello"[..]).unwrap()
        });
        let receiver = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s1, 0, &mut out).unwrap();
            out
        });

        assert_eq!(sender.join().unwrap(), 5);
        assert_eq!(receiver.join().unwrap(), b"hello");

        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));

    let (sizes, payload) = decode_stream(&edge_frames(&outcome.frames, 0, 1));
    assert_eq!(payload, b"hello");
    assert_eq!(sizes.iter().sum::<usize>(), 5);
}

#[test]
fn test_zero_byte_send() {
    let outcome = run_job(2, |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }
        let s0 = sockets[0].clone();
        let s1 = sockets[1].clone();

        let sender =
            thread::spawn(move || client::send_stream(&s0, 1, &mut &b""[..]).unwrap());
        let receiver = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s1, 0, &mut out).unwrap();
            out
        });

        assert_eq!(sender.join().unwrap(), 0);
        assert!(receiver.join().unwrap().is_empty());

        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));

    // the peer sees exactly one zero-size terminator and nothing else
    let edge = edge_frames(&outcome.frames, 0, 1);
    assert_eq!(edge.len(), 1);
    let (sizes, payload) = decode_stream(&edge);
    assert!(sizes.is_empty());
    assert!(payload.is_empty());
}

#[test]
fn test_multi_chunk_send() {
    let data = vec![0u8; 200_000];
    let expected = data.clone();

    let outcome = run_job(2, move |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }
        let s0 = sockets[0].clone();
        let s1 = sockets[1].clone();

        let sender = thread::spawn(move || {
            client::send_stream(&s0, 1, &mut &data[..]).unwrap()
        });
        let receiver = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s1, 0, &mut out).unwrap();
            out
        });

        assert_eq!(sender.join().unwrap(), 200_000);
        assert_eq!(receiver.join().unwrap().len(), 200_000);

        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));

    let (sizes, payload) = decode_stream(&edge_frames(&outcome.frames, 0, 1));
    assert_eq!(payload, expected);
    assert!(sizes.len() >= 4, "200000 bytes need at least four chunks");
    assert!(sizes.iter().all(|&s| s <= CHUNK_CAP));
    assert_eq!(sizes.iter().sum::<usize>(), 200_000);
}

#[test]
fn test_bidirectional_streams() {
    // two independent channels between the same pair of ranks
    let outcome = run_job(2, |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }
        let s0 = sockets[0].clone();
        let s1 = sockets[1].clone();
        let s0b = sockets[0].clone();
        let s1b = sockets[1].clone();

        let forward = thread::spawn(move || {
            client::send_stream(&s0, 1, &mut &b"forward"[..]).unwrap();
        });
        let backward = thread::spawn(move || {
            client::send_stream(&s1, 0, &mut &b"backward"[..]).unwrap();
        });

        let recv_on_1 = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s1b, 0, &mut out).unwrap();
            out
        });
        let recv_on_0 = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s0b, 1, &mut out).unwrap();
            out
        });

        forward.join().unwrap();
        backward.join().unwrap();
        assert_eq!(recv_on_1.join().unwrap(), b"forward");
        assert_eq!(recv_on_0.join().unwrap(), b"backward");

        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));
}

// ============================================================================
// Channel queueing
// ============================================================================

#[test]
fn test_channel_queueing_pairs_streams_in_arrival_order() {
    let payload_a = vec![b'A'; 512];
    let payload_b = vec![b'B'; 512];
    let expected_a = payload_a.clone();
    let expected_b = payload_b.clone();

    let outcome = run_job(2, move |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }
        let s0a = sockets[0].clone();
        let s0b = sockets[0].clone();
        let s1a = sockets[1].clone();
        let s1b = sockets[1].clone();

        // arrival order at each arbiter decides the pairing: sender A and
        // receiver 1 are first on their respective channels
        let sender_a = thread::spawn(move || {
            client::send_stream(&s0a, 1, &mut &payload_a[..]).unwrap();
        });
        thread::sleep(Duration::from_millis(300));
        let sender_b = thread::spawn(move || {
            client::send_stream(&s0b, 1, &mut &payload_b[..]).unwrap();
        });

        let receiver_1 = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s1a, 0, &mut out).unwrap();
            out
        });
        thread::sleep(Duration::from_millis(300));
        let receiver_2 = thread::spawn(move || {
            let mut out = Vec::new();
            client::recv_stream(&s1b, 0, &mut out).unwrap();
            out
        });

        sender_a.join().unwrap();
        sender_b.join().unwrap();
        assert_eq!(receiver_1.join().unwrap(), expected_a);
        assert_eq!(receiver_2.join().unwrap(), expected_b);

        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));
}

#[test]
fn test_sequential_streams_on_one_channel_stay_ordered() {
    let outcome = run_job(2, |sockets| {
        for socket in &sockets {
            wait_listening(socket);
        }

        client::send_stream(&sockets[0], 1, &mut &b"first"[..]).unwrap();
        client::send_stream(&sockets[0], 1, &mut &b"second"[..]).unwrap();

        let mut out = Vec::new();
        client::recv_stream(&sockets[1], 0, &mut out).unwrap();
        assert_eq!(out, b"first");

        let mut out = Vec::new();
        client::recv_stream(&sockets[1], 0, &mut out).unwrap();
        assert_eq!(out, b"second");

        for socket in &sockets {
            client::finalize(socket).unwrap();
        }
    });

    assert!(outcome.results.iter().all(|r| r.is_ok()));
}
