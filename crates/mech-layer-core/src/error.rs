use crate::process::ProcessStatus;
use thiserror::Error;

/// Core error types for Mech lifecycle and bootstrap operations
#[derive(Error, Debug)]
pub enum MechError {
    #[error("Failed to spawn server process: {0}")]
    Spawn(String),

    /// Every attempt was refused; carries the last refusal.
    #[error("Server never became reachable: connection refused after {attempts} attempts")]
    ConnectionRefused {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Server process exited before accepting a connection ({status})")]
    ServerExited { status: ProcessStatus },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lifecycle already started")]
    AlreadyStarted,

    #[error("Bootstrap task aborted: {0}")]
    BootstrapAborted(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl MechError {
    /// Check if this error is retryable
    ///
    /// Only a bare refusal is transient; everything the bootstrapper
    /// surfaces has already used up its attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MechError::Io(e) if is_connection_refused(e))
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MechError::Configuration(_) | MechError::Cancelled | MechError::AlreadyStarted
        )
    }

    /// Check if the server was never reachable (refused until the retry budget ran out)
    pub fn is_refused_exhausted(&self) -> bool {
        matches!(self, MechError::ConnectionRefused { .. })
    }

    /// Number of connection attempts made before the error, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            MechError::ConnectionRefused { attempts, .. }
            | MechError::Connection { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Whether an I/O error means nothing is listening at the endpoint yet
pub fn is_connection_refused(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::ConnectionRefused
}
