//! Error types for pool operations

use crate::factory::CreateError;

/// Errors from pool operations.
///
/// `Clone` so that one creation attempt's outcome can be handed to every
/// caller attached to it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Process-scoped: the pool cannot initialize.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation-scoped: nothing available, nothing created, degradation disallowed.
    #[error("pool {pool} exhausted after {trials} creation trials: {reason}")]
    Exhausted {
        pool: String,
        trials: u32,
        reason: String,
    },

    #[error("identity creation failed: {0}")]
    Create(#[from] CreateError),

    #[error("store error: {0}")]
    Store(#[from] identity_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
