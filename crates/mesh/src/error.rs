use thiserror::Error;

/// Errors that can occur while bringing up or running a mesh node.
///
/// Only startup-time failures are surfaced as errors; runtime faults on the
/// wire (bad frames, lost datagrams, dead subscriptions) are logged and
/// absorbed so a single bad peer can never take a loop down.
#[derive(Error, Debug)]
pub enum MeshError {
    /// No free publisher port found in the configured range
    #[error("no free port in {0}..={1}")]
    NoPortAvailable(u16, u16),

    /// An explicitly requested port could not be bound
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    /// Obfuscation key has the wrong length
    #[error("obfuscation key must be {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    /// Discovery socket setup failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// I/O operation failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;
