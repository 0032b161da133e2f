//! Error types for store operations

/// Errors from durable store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store document parse error: {0}")]
    Parse(String),

    #[error("store closed: {0}")]
    Closed(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
