//! Durable store contract for identity pools
//!
//! Defines the `IdentityStore` trait that pools reconcile against. Several
//! independent pool instances may share one store; each pushes its full record
//! set keyed by pool name and merges the store's answer back into memory.
//!
//! Two implementations ship with the crate:
//! - `MemoryStore` keeps documents in process and wakes waiting pulls on push
//! - `FileStore` keeps every pool in one JSON file with atomic writes

pub mod document;
pub mod error;
pub mod file;
pub mod memory;

pub use document::{PoolDocument, PoolUpdate, StoreState, StoredIdentity};
pub use error::{Error, Result};
pub use file::FileStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Predicate evaluated against a pool's document (`None` when absent).
pub type WaitPredicate = Arc<dyn Fn(Option<&PoolDocument>) -> bool + Send + Sync>;

/// Blocking condition for `IdentityStore::pull`.
///
/// The pull returns only once `predicate` holds for the pool's document.
/// `message` is logged when the caller starts waiting.
#[derive(Clone)]
pub struct WaitCondition {
    pub message: String,
    pub predicate: WaitPredicate,
}

impl WaitCondition {
    pub fn new(
        message: impl Into<String>,
        predicate: impl Fn(Option<&PoolDocument>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Wait until the pool holds at least one identity.
    pub fn non_empty(pool: &str) -> Self {
        Self::new(
            format!("waiting for identities in pool {pool}"),
            |doc| doc.is_some_and(|d| !d.is_empty()),
        )
    }

    pub fn is_satisfied(&self, doc: Option<&PoolDocument>) -> bool {
        (self.predicate)(doc)
    }
}

impl std::fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitCondition")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Abstraction over the durable store shared by pool instances.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn IdentityStore>`).
pub trait IdentityStore: Send + Sync {
    /// Read the current document for `pool`.
    ///
    /// Returns `None` if the store has no document under that name. With a
    /// wait condition the call blocks until the condition holds.
    fn pull<'a>(
        &'a self,
        pool: &'a str,
        wait: Option<WaitCondition>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PoolDocument>>> + Send + 'a>>;

    /// Merge-write `update` into the document for `pool` and return the
    /// resulting document.
    fn push<'a>(
        &'a self,
        pool: &'a str,
        update: PoolUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<PoolDocument>> + Send + 'a>>;
}
