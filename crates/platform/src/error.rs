//! Error types shared across ikev2d crates

use std::fmt;

/// Error returned by module lifecycle operations
#[derive(Debug)]
pub enum PlatformError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration rejected at startup
    Config(String),

    /// Protocol engine failure
    Protocol(String),

    /// Module used outside its lifecycle (e.g. before `init`)
    Lifecycle(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Io(e) => write!(f, "IO error: {}", e),
            PlatformError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PlatformError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PlatformError::Lifecycle(msg) => write!(f, "Lifecycle error: {}", msg),
            PlatformError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Io(e) => Some(e),
            PlatformError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Io(err)
    }
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;
