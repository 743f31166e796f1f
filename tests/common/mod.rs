//! Shared harness for the integration tests.
//!
//! Runs all daemons of a job on the test's main thread (current-thread
//! runtime + LocalSet, exactly like the production binary) over a loopback
//! fabric, while the client scenario runs real Unix-socket clients on a
//! worker thread.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mpih::config::{DaemonConfig, LogTarget, Tuning};
use mpih::daemon::{Daemon, DaemonError};
use mpih::transport::{Frame, LoopbackFabric};

/// Result of a completed job: per-rank daemon results plus every message
/// that crossed the fabric, in post order.
pub struct JobOutcome {
    pub results: Vec<Result<(), DaemonError>>,
    pub frames: Vec<Frame>,
}

/// Run a `size`-rank job: daemons on this thread, `clients` on a worker
/// thread. Returns once every daemon has shut down.
pub fn run_job<F>(size: i32, clients: F) -> JobOutcome
where
    F: FnOnce(Vec<PathBuf>) + Send + 'static,
{
    let dir = tempfile::tempdir().expect("create job dir");
    let fabric = LoopbackFabric::new(size);
    let sockets: Vec<PathBuf> = (0..size)
        .map(|rank| dir.path().join(format!("rank{}.sock", rank)))
        .collect();

    let daemons: Vec<Daemon> = (0..size)
        .map(|rank| {
            let config = DaemonConfig {
                socket_path: sockets[rank as usize].clone(),
                log: LogTarget::Disabled,
                pid_file: None,
                foreground: true,
                verbose: 0,
                tuning: Tuning::default(),
            };
            Daemon::new(config, Rc::new(fabric.transport(rank))).expect("create daemon")
        })
        .collect();

    let client_sockets = sockets.clone();
    let client_thread = std::thread::spawn(move || clients(client_sockets));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    let local = tokio::task::LocalSet::new();

    let results = local.block_on(&rt, async move {
        let handles: Vec<_> = daemons
            .into_iter()
            .map(|daemon| tokio::task::spawn_local(async move { daemon.run().await }))
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(30), handle)
                .await
                .expect("daemon did not shut down within 30s")
                .expect("daemon task panicked");
            results.push(result);
        }
        results
    });

    client_thread.join().expect("client scenario panicked");

    JobOutcome {
        results,
        frames: fabric.frames(),
    }
}

/// Block until the daemon's listener socket exists.
pub fn wait_listening(socket: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() {
        assert!(
            Instant::now() < deadline,
            "daemon never bound {}",
            socket.display()
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Decode one complete stream from the frames of a single fabric edge:
/// alternating (size, payload) messages ending in a zero size. Returns the
/// chunk sizes and the reassembled payload.
pub fn decode_stream(frames: &[&Frame]) -> (Vec<usize>, Vec<u8>) {
    let mut sizes = Vec::new();
    let mut payload = Vec::new();
    let mut iter = frames.iter();

    loop {
        let size_frame = iter.next().expect("stream missing its size frame");
        assert_eq!(size_frame.data.len(), 4, "size frames are 4 bytes");
        let size = i32::from_ne_bytes(size_frame.data[..].try_into().unwrap());

        if size == 0 {
            assert!(
                iter.next().is_none(),
                "no frames may follow the end-of-stream marker"
            );
            return (sizes, payload);
        }

        let body = iter.next().expect("stream missing a payload frame");
        assert_eq!(body.data.len(), size as usize, "payload matches its size");
        sizes.push(size as usize);
        payload.extend_from_slice(&body.data);
    }
}

/// Frames posted on one (source, dest) edge, in order.
pub fn edge_frames<'a>(frames: &'a [Frame], source: i32, dest: i32) -> Vec<&'a Frame> {
    frames
        .iter()
        .filter(|f| f.source == source && f.dest == dest)
        .collect()
}
