//! Daemon configuration
//!
//! Runtime options come from the command line with environment fallbacks
//! (`MPIH_SOCKET`, `MPIH_PIDFILE`); tuning knobs can additionally be loaded
//! from a TOML file for deployments that need non-default chunking or poll
//! cadence.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Where daemon log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Logging disabled entirely.
    Disabled,
    /// Log to stdout. Only honoured in foreground mode; a backgrounded
    /// daemon has its stdio redirected to /dev/null.
    Stdout,
    /// Log to a line-buffered regular file.
    File(PathBuf),
}

impl LogTarget {
    /// Resolve the `--log` flag against the foreground flag.
    ///
    /// `-` means stdout, but stdout only exists for a foreground daemon;
    /// requesting `-` for a backgrounded daemon disables logging.
    pub fn resolve(log: Option<&str>, foreground: bool) -> Self {
        match log {
            None => LogTarget::Disabled,
            Some("-") => {
                if foreground {
                    LogTarget::Stdout
                } else {
                    LogTarget::Disabled
                }
            }
            Some(path) => LogTarget::File(PathBuf::from(path)),
        }
    }
}

/// Tuning knobs for the daemon core.
///
/// All fields default to the values in [`constants`]; a TOML file may
/// override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    /// Largest payload per wire chunk, in bytes.
    #[serde(default = "default_chunk_cap")]
    pub chunk_cap: usize,

    /// Transport poll and channel re-request cadence, in microseconds.
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,

    /// Maximum header line length, newline included.
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,

    /// High-water mark for a single socket read, in bytes.
    #[serde(default = "default_read_high_water")]
    pub read_high_water: usize,
}

fn default_chunk_cap() -> usize {
    constants::CHUNK_CAP
}

fn default_poll_interval_us() -> u64 {
    constants::POLL_INTERVAL.as_micros() as u64
}

fn default_max_header_size() -> usize {
    constants::MAX_HEADER_SIZE
}

fn default_read_high_water() -> usize {
    constants::MAX_BUFFER_SIZE
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            chunk_cap: default_chunk_cap(),
            poll_interval_us: default_poll_interval_us(),
            max_header_size: default_max_header_size(),
            read_high_water: default_read_high_water(),
        }
    }
}

impl Tuning {
    /// Load tuning overrides from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadError(format!("failed to read {}: {}", path.display(), e))
        })?;

        let tuning: Tuning = toml::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("failed to parse {}: {}", path.display(), e))
        })?;

        tuning.validate()?;

        Ok(tuning)
    }

    /// Validate tuning values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // chunk sizes travel as a 32-bit integer on the wire
        if self.chunk_cap == 0 || self.chunk_cap > i32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "chunk_cap must be between 1 and {} bytes",
                i32::MAX
            )));
        }

        if self.poll_interval_us == 0 || self.poll_interval_us > 1_000_000 {
            return Err(ConfigError::ValidationError(
                "poll_interval_us must be between 1 and 1000000".to_string(),
            ));
        }

        if self.max_header_size < 16 || self.max_header_size > 4096 {
            return Err(ConfigError::ValidationError(
                "max_header_size must be between 16 and 4096 bytes".to_string(),
            ));
        }

        if self.read_high_water == 0 {
            return Err(ConfigError::ValidationError(
                "read_high_water must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Poll cadence as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

/// Full daemon configuration assembled from flags, environment, and the
/// optional tuning file.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path of the Unix socket the daemon listens on.
    pub socket_path: PathBuf,

    /// Log destination.
    pub log: LogTarget,

    /// Readiness/pid file, written after the listener is bound.
    pub pid_file: Option<PathBuf>,

    /// Stay attached to the terminal instead of forking.
    pub foreground: bool,

    /// Verbosity level (0 = warnings, 1 = info, 2 = debug, 3+ = trace).
    pub verbose: u8,

    /// Core tuning knobs.
    pub tuning: Tuning,
}

impl DaemonConfig {
    /// Validate the assembled configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingSocketPath);
        }
        self.tuning.validate()
    }
}

/// Resolve the socket path from an explicit flag or the environment.
///
/// The flag wins; `env` is the value of `MPIH_SOCKET` as observed by the
/// caller (passed in so resolution stays a pure function).
pub fn resolve_socket(
    flag: Option<PathBuf>,
    env: Option<OsString>,
) -> Result<PathBuf, ConfigError> {
    match flag {
        Some(path) if !path.as_os_str().is_empty() => Ok(path),
        _ => match env {
            Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
            _ => Err(ConfigError::MissingSocketPath),
        },
    }
}

/// Resolve an optional path flag against an environment fallback.
pub fn resolve_optional(flag: Option<PathBuf>, env: Option<OsString>) -> Option<PathBuf> {
    flag.or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no socket path specified (use --socket or MPIH_SOCKET)")]
    MissingSocketPath,

    #[error("{0}")]
    ReadError(String),

    #[error("{0}")]
    ParseError(String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}
