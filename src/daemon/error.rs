//! Error types for the daemon core.

use std::io;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Error type for daemon operations
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind socket `{path}`: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A client violated the protocol in a way that indicates a script
    /// bug, e.g. issuing a header after finalize was latched. The daemon
    /// exits non-zero with this diagnostic.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}
