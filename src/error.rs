//! Error types for serving and fetching blocks, and for configuration.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Typed failure of a block request, both when serving and when forwarding.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// Folder not shared with the requester, or no such file
    #[error("no such file")]
    NoSuchFile,

    /// Requested block is not (yet) available
    #[error("invalid request: block not available")]
    Invalid,

    /// Connection to the target device was torn down
    #[error("connection closed")]
    Closed,

    /// Local storage read failed
    #[error("i/o failure: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for RequestError {
    fn from(err: io::Error) -> Self {
        RequestError::Io(Arc::new(err))
    }
}

/// Failure to obtain a block from any peer.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("no connected device has the block")]
    NoCandidates,

    #[error("all {attempts} candidate devices failed, last error: {last}")]
    Exhausted { attempts: usize, last: RequestError },
}

/// Configuration and startup errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: RequestError = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        assert!(matches!(err, RequestError::Io(_)));
        assert!(err.to_string().contains("short"));
    }

    #[test]
    fn test_exhausted_message() {
        let err = FetchError::Exhausted {
            attempts: 3,
            last: RequestError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "all 3 candidate devices failed, last error: connection closed"
        );
    }
}
