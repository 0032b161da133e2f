//! Creation and error-classification seams
//!
//! The pool never knows how identities are minted. A host injects an
//! `IdentityFactory` and, optionally, an `ErrorClassifier` that decides which
//! creation failures are worth retrying.

use std::future::Future;
use std::pin::Pin;

/// Failure reported by an `IdentityFactory`.
///
/// `status` carries an upstream status code when the factory talks to a
/// remote service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CreateError {
    pub message: String,
    pub status: Option<u16>,
}

impl CreateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Outcome of one creation call: a payload, nothing, or a failure.
pub type CreateResult = std::result::Result<Option<serde_json::Value>, CreateError>;

/// Mints new identity payloads.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn IdentityFactory>`).
pub trait IdentityFactory: Send + Sync {
    /// Produce a payload for a new identity, or `Ok(None)` when none can be made right now.
    fn create(&self) -> Pin<Box<dyn Future<Output = CreateResult> + Send + '_>>;
}

/// Decides whether a creation failure is retryable.
pub trait ErrorClassifier: Send + Sync {
    /// Return a non-empty explanation to retry, or `None` to fail the acquisition.
    fn classify<'a>(
        &'a self,
        error: &'a CreateError,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;
}

/// Adapts an async closure into an `IdentityFactory`.
pub struct FnFactory<F>(pub F);

impl<F, Fut> IdentityFactory for FnFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CreateResult> + Send + 'static,
{
    fn create(&self) -> Pin<Box<dyn Future<Output = CreateResult> + Send + '_>> {
        Box::pin((self.0)())
    }
}

/// Adapts a plain closure into an `ErrorClassifier`.
pub struct FnClassifier<F>(pub F);

impl<F> ErrorClassifier for FnClassifier<F>
where
    F: Fn(&CreateError) -> Option<String> + Send + Sync,
{
    fn classify<'a>(
        &'a self,
        error: &'a CreateError,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(std::future::ready((self.0)(error)))
    }
}
