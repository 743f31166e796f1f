//! Process plumbing: backgrounding, pid files, and daemon launch
//!
//! Backgrounding here is deliberately not textbook daemonization. The
//! forked child keeps its process group and controlling terminal so the
//! daemon is torn down together with the shell that spawned it; only the
//! fork and the stdio redirection happen.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::constants::STARTUP_TIMEOUT;

/// Which side of the backgrounding fork we are on.
pub enum Fork {
    /// The original process; it should exit immediately with status 0.
    Parent { child: libc::pid_t },
    /// The daemon-to-be.
    Child,
}

/// Fork into the background. The child intentionally stays in the caller's
/// process group with the controlling terminal attached, and gets its
/// stdio redirected to /dev/null.
pub fn background() -> io::Result<Fork> {
    // SAFETY: single fork in a single-threaded startup path, before any
    // runtime threads exist
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        return Ok(Fork::Parent { child: pid });
    }

    redirect_stdio_to_devnull()?;
    Ok(Fork::Child)
}

fn redirect_stdio_to_devnull() -> io::Result<()> {
    let devnull = File::options().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for stdio_fd in 0..=2 {
        // SAFETY: dup2 onto the standard descriptors of our own process
        if unsafe { libc::dup2(fd, stdio_fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Write the daemon's pid file. Called after the listener is bound, so the
/// file's existence doubles as the readiness signal.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Errors raised while launching a daemon for `mpih run`.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn daemon: {0}")]
    Spawn(io::Error),

    #[error("timed out waiting for the daemon to become ready")]
    StartupTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Options for spawning an `mpih init` daemon as a child process.
pub struct DaemonLaunch {
    pub socket: PathBuf,
    pub log: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub verbose: u8,
}

/// Spawn `mpih init` (this very executable) in the foreground as a child
/// process and wait for it to become ready.
pub fn spawn_daemon(launch: &DaemonLaunch) -> Result<Child, LaunchError> {
    let exe = std::env::current_exe().map_err(LaunchError::Spawn)?;

    let mut cmd = Command::new(exe);
    cmd.arg("init")
        .arg("--socket")
        .arg(&launch.socket)
        .arg("--pid-file")
        .arg(&launch.pid_file)
        .arg("--foreground");
    if let Some(log) = &launch.log {
        cmd.arg("--log").arg(log);
    }
    for _ in 0..launch.verbose {
        cmd.arg("-v");
    }

    // keep stderr attached so daemon startup failures reach the user
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(LaunchError::Spawn)?;
    info!("daemon spawned with pid {}", child.id());

    wait_for_ready(&launch.pid_file, STARTUP_TIMEOUT)?;
    Ok(child)
}

/// Poll for the daemon's pid file until it appears or the timeout expires.
pub fn wait_for_ready(pid_file: &Path, timeout: Duration) -> Result<(), LaunchError> {
    let start = Instant::now();
    loop {
        if pid_file.exists() {
            debug!("daemon is ready");
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(LaunchError::StartupTimeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
