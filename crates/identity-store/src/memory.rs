//! In-process store
//!
//! Holds every pool document in memory. Each push bumps a `watch` version so
//! that pulls blocked on a wait condition re-evaluate it.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::document::{PoolDocument, PoolUpdate, StoreState};
use crate::error::{Error, Result};
use crate::{IdentityStore, WaitCondition};

/// Store backed by a process-local map.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    version: watch::Sender<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(StoreState::new()),
            version,
        }
    }

    /// Replace the document for `pool`.
    pub async fn seed(&self, pool: &str, doc: PoolDocument) {
        self.state.lock().await.insert(pool.to_string(), doc);
        self.version.send_modify(|v| *v += 1);
    }

    /// Create an empty document for `pool` unless one exists.
    pub async fn ensure_pool(&self, pool: &str) {
        self.state
            .lock()
            .await
            .entry(pool.to_string())
            .or_default();
    }

    /// Current document for `pool`, without waiting.
    pub async fn document(&self, pool: &str) -> Option<PoolDocument> {
        self.state.lock().await.get(pool).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore for MemoryStore {
    fn pull<'a>(
        &'a self,
        pool: &'a str,
        wait: Option<WaitCondition>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PoolDocument>>> + Send + 'a>> {
        Box::pin(async move {
            let Some(wait) = wait else {
                return Ok(self.document(pool).await);
            };

            // Subscribe before the first check so a push in between is not missed
            let mut changes = self.version.subscribe();
            let mut announced = false;
            loop {
                {
                    let state = self.state.lock().await;
                    let doc = state.get(pool);
                    if wait.is_satisfied(doc) {
                        return Ok(doc.cloned());
                    }
                }
                if !announced {
                    info!(pool, "{}", wait.message);
                    announced = true;
                }
                changes
                    .changed()
                    .await
                    .map_err(|_| Error::Closed(format!("memory store dropped while {}", wait.message)))?;
            }
        })
    }

    fn push<'a>(
        &'a self,
        pool: &'a str,
        update: PoolUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<PoolDocument>> + Send + 'a>> {
        Box::pin(async move {
            let doc = {
                let mut state = self.state.lock().await;
                let doc = state.entry(pool.to_string()).or_default();
                update.apply_to(doc);
                doc.clone()
            };
            self.version.send_modify(|v| *v += 1);
            debug!(pool, identities = doc.identities.len(), "memory store updated");
            Ok(doc)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::StoredIdentity;
    use std::sync::Arc;
    use std::time::Duration;

    fn update_with(id: &str) -> PoolUpdate {
        let mut update = PoolUpdate::default();
        update.identities.insert(
            id.to_string(),
            Some(StoredIdentity {
                data: serde_json::json!(id),
                ..Default::default()
            }),
        );
        update
    }

    #[tokio::test]
    async fn pull_unknown_pool_returns_none() {
        let store = MemoryStore::new();
        assert!(store.pull("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_creates_document_and_returns_it() {
        let store = MemoryStore::new();
        let doc = store.push("p", update_with("a")).await.unwrap();
        assert_eq!(doc.identities.len(), 1);

        let pulled = store.pull("p", None).await.unwrap().unwrap();
        assert_eq!(pulled, doc);
    }

    #[tokio::test]
    async fn push_merges_with_existing_identities() {
        let store = MemoryStore::new();
        store.push("p", update_with("a")).await.unwrap();
        let doc = store.push("p", update_with("b")).await.unwrap();
        assert_eq!(doc.identities.len(), 2);
    }

    #[tokio::test]
    async fn ensure_pool_keeps_existing_document() {
        let store = MemoryStore::new();
        store.push("p", update_with("a")).await.unwrap();
        store.ensure_pool("p").await;
        store.ensure_pool("q").await;

        assert_eq!(store.document("p").await.unwrap().identities.len(), 1);
        assert!(store.document("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn waiting_pull_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_pool("p").await;

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .pull("p", Some(WaitCondition::non_empty("p")))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "pull must block while the pool is empty");

        store.push("p", update_with("a")).await.unwrap();
        let doc = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(doc.identities.contains_key("a"));
    }

    #[tokio::test]
    async fn satisfied_wait_returns_immediately() {
        let store = MemoryStore::new();
        store.push("p", update_with("a")).await.unwrap();
        let doc = store
            .pull("p", Some(WaitCondition::non_empty("p")))
            .await
            .unwrap();
        assert!(doc.is_some());
    }
}
