//! Pool handle, acquisition loop and lease lifecycle
//!
//! `acquire` alternates between two states until it can answer:
//! - Selecting: scan the records for the best available identity; if one is
//!   found it is touched (and optionally leased) under the same write lock
//! - Creating/Waiting: hand over to the single-flight creator, which either
//!   asks for another scan, tells the caller to go without an identity, or fails
//!
//! Lifecycle mutators (`lease`, `release`, `touch`, `update`, `renew`,
//! `deprecate`, `remove`) accept an id or a previously returned snapshot.
//! Unknown ids are ignored so that stale references after a concurrent removal
//! are harmless. Every effective mutation schedules a store sync.

use std::sync::{Arc, Mutex as StdMutex};

use identity_store::IdentityStore;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::creator::{Attempt, AttemptFuture};
use crate::error::{Error, Result};
use crate::factory::{ErrorClassifier, IdentityFactory};
use crate::options::PoolOptions;
use crate::record::{Identity, IdentityRef, RecordStore, now_millis};
use crate::select;
use crate::sync::SyncState;

/// State shared between pool handles, the creator and the flush task.
pub(crate) struct Inner {
    pub(crate) name: String,
    pub(crate) options: PoolOptions,
    pub(crate) records: RwLock<RecordStore>,
    pub(crate) factory: Option<Arc<dyn IdentityFactory>>,
    pub(crate) classifier: Option<Arc<dyn ErrorClassifier>>,
    pub(crate) store: Option<Arc<dyn IdentityStore>>,
    /// Signalled when a lease is released or the store adds identities.
    pub(crate) availability: Notify,
    /// In-flight creation attempt, if any.
    pub(crate) creation: Mutex<Option<AttemptFuture>>,
    pub(crate) sync: StdMutex<SyncState>,
    pub(crate) flush_gate: Mutex<()>,
}

/// Per-call acquisition options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Take a lease on the returned identity.
    pub lease: bool,
}

impl AcquireOptions {
    pub fn leased() -> Self {
        Self { lease: true }
    }
}

/// Pool of reusable, rate-limited identities.
///
/// Cheap to clone; clones share the same records and in-flight operations.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub fn builder(name: impl Into<String>) -> PoolBuilder {
        PoolBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn is_store_backed(&self) -> bool {
        self.inner.store.is_some()
    }

    /// Hand out an available identity, creating or waiting for one if needed.
    ///
    /// Returns `Ok(None)` only when `allow_no_identity` is set and nothing
    /// could be found or created.
    pub async fn acquire(&self, consumer: &str, options: AcquireOptions) -> Result<Option<Identity>> {
        loop {
            if let Some(identity) = self.inner.select_and_touch(consumer, options.lease).await {
                return Ok(Some(identity));
            }
            match self.inner.create_or_wait().await {
                Ok(Attempt::Retry) => continue,
                Ok(Attempt::NoIdentity) => {
                    self.inner.record_acquisition("none");
                    return Ok(None);
                }
                Err(e) => {
                    self.inner.record_acquisition("error");
                    return Err(e);
                }
            }
        }
    }

    /// Take (or extend) a lease. Returns false for unknown ids.
    pub async fn lease<'a>(&self, consumer: &str, identity: impl Into<IdentityRef<'a>>) -> bool {
        let id = identity.into().id();
        let leased = {
            let mut records = self.inner.records.write().await;
            match records.get_mut(id) {
                Some(identity) => {
                    identity.locked = Some(now_millis());
                    true
                }
                None => false,
            }
        };
        if leased {
            info!(pool = %self.inner.name, consumer, identity_id = id, "identity leased");
            self.inner.schedule_sync();
        } else {
            debug!(pool = %self.inner.name, consumer, identity_id = id, "lease ignored, identity unknown");
        }
        leased
    }

    /// Clear a lease. Returns false if the identity is unknown or not leased.
    pub async fn release<'a>(&self, consumer: &str, identity: impl Into<IdentityRef<'a>>) -> bool {
        let id = identity.into().id();
        let released = {
            let mut records = self.inner.records.write().await;
            unlock(&mut records, id)
        };
        if released {
            debug!(pool = %self.inner.name, consumer, identity_id = id, "identity released");
            self.inner.availability.notify_waiters();
            self.inner.schedule_sync();
        }
        released
    }

    /// Mark an identity as used now.
    pub async fn touch<'a>(&self, consumer: &str, identity: impl Into<IdentityRef<'a>>) -> bool {
        let id = identity.into().id();
        let touched = {
            let mut records = self.inner.records.write().await;
            match records.get_mut(id) {
                Some(identity) => {
                    identity.last_time_used = now_millis();
                    true
                }
                None => false,
            }
        };
        if touched {
            debug!(pool = %self.inner.name, consumer, identity_id = id, "identity touched");
            self.inner.schedule_sync();
        }
        touched
    }

    /// Replace an identity's payload.
    pub async fn update<'a>(
        &self,
        consumer: &str,
        identity: impl Into<IdentityRef<'a>>,
        data: serde_json::Value,
    ) -> bool {
        let id = identity.into().id();
        let updated = {
            let mut records = self.inner.records.write().await;
            match records.get_mut(id) {
                Some(identity) => {
                    identity.data = data;
                    true
                }
                None => false,
            }
        };
        if updated {
            debug!(pool = %self.inner.name, consumer, identity_id = id, "identity updated");
            self.inner.schedule_sync();
        }
        updated
    }

    /// Forget earlier deprecations. Returns true if the counter was reset.
    pub async fn renew<'a>(&self, consumer: &str, identity: impl Into<IdentityRef<'a>>) -> bool {
        let id = identity.into().id();
        let renewed = {
            let mut records = self.inner.records.write().await;
            match records.get_mut(id) {
                Some(identity) if identity.deprecated != 0 => {
                    identity.deprecated = 0;
                    true
                }
                _ => false,
            }
        };
        if renewed {
            info!(pool = %self.inner.name, consumer, identity_id = id, "identity renewed");
            self.inner.schedule_sync();
        }
        renewed
    }

    /// Report a soft failure. Removes the identity once the deprecation limit
    /// is reached, and always clears its lease.
    pub async fn deprecate<'a>(&self, consumer: &str, identity: impl Into<IdentityRef<'a>>) -> bool {
        let id = identity.into().id();
        let limit = self.inner.options.deprecation_limit();
        let outcome = {
            let mut records = self.inner.records.write().await;
            match records.get_mut(id) {
                Some(identity) => {
                    identity.deprecated = identity.deprecated.saturating_add(1);
                    let count = identity.deprecated;
                    let removed = limit.is_some_and(|limit| count >= limit);
                    if removed {
                        self.inner.retire(&mut records, id);
                    }
                    let unlocked = unlock(&mut records, id);
                    Some((count, removed, unlocked))
                }
                None => None,
            }
        };

        let Some((count, removed, unlocked)) = outcome else {
            debug!(pool = %self.inner.name, consumer, identity_id = id, "deprecation ignored, identity unknown");
            return false;
        };
        if removed {
            warn!(pool = %self.inner.name, consumer, identity_id = id, deprecated = count, "identity removed after repeated deprecation");
        } else {
            info!(pool = %self.inner.name, consumer, identity_id = id, deprecated = count, "identity deprecated");
        }
        if unlocked {
            self.inner.availability.notify_waiters();
        }
        self.inner.schedule_sync();
        true
    }

    /// Remove an identity from the pool.
    pub async fn remove<'a>(&self, consumer: &str, identity: impl Into<IdentityRef<'a>>) -> bool {
        let id = identity.into().id();
        let removed = {
            let mut records = self.inner.records.write().await;
            self.inner.retire(&mut records, id)
        };
        if removed {
            info!(pool = %self.inner.name, consumer, identity_id = id, "identity removed");
            self.inner.schedule_sync();
        }
        removed
    }

    /// Snapshot of one active identity.
    pub async fn get(&self, id: &str) -> Option<Identity> {
        self.inner.records.read().await.get(id).cloned()
    }

    /// Snapshot of every active identity, in insertion order.
    pub async fn identities(&self) -> Vec<Identity> {
        self.inner.records.read().await.active().cloned().collect()
    }

    /// Pool health summary.
    ///
    /// Returns per-identity status (never the payload) and overall pool
    /// health: all available → healthy, some available → degraded, none
    /// available → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let records = self.inner.records.read().await;
        let options = &self.inner.options;
        let now = now_millis();

        let mut identities = Vec::new();
        let mut available = 0usize;
        let mut locked = 0usize;
        let mut cooling = 0usize;
        let mut deprecated = 0usize;

        for identity in records.active() {
            let status = if !select::lease_expired(identity, options, now) {
                locked += 1;
                "locked"
            } else if select::cooling_down(identity, options, now) {
                cooling += 1;
                "cooling_down"
            } else {
                available += 1;
                "available"
            };
            if identity.deprecated > 0 {
                deprecated += 1;
            }
            identities.push(serde_json::json!({
                "id": identity.id,
                "status": status,
                "deprecated": identity.deprecated,
                "last_time_used": identity.last_time_used,
                "locked": identity.locked,
            }));
        }

        let total = identities.len();
        let pool_status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "pool": self.inner.name,
            "status": pool_status,
            "store_backed": self.inner.store.is_some(),
            "identities_total": total,
            "identities_available": available,
            "identities_locked": locked,
            "identities_cooling_down": cooling,
            "identities_deprecated": deprecated,
            "identities_pending_removal": records.pending_removals().len(),
            "identities": identities,
        })
    }

    /// Final, non-debounced store sync. Call once on teardown.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.store.is_none() {
            return Ok(());
        }
        self.inner.flush().await?;
        info!(pool = %self.inner.name, "final store sync complete");
        Ok(())
    }
}

impl Inner {
    async fn select_and_touch(self: &Arc<Self>, consumer: &str, lease: bool) -> Option<Identity> {
        let selected = {
            let mut records = self.records.write().await;
            let now = now_millis();
            let id = select::select(records.active(), &self.options, now)?.id.clone();
            let identity = records.get_mut(&id)?;
            identity.last_time_used = now;
            if lease {
                identity.locked = Some(now);
            }
            identity.clone()
        };
        info!(pool = %self.name, consumer, identity_id = %selected.id, leased = lease, "identity selected");
        self.record_acquisition("selected");
        self.schedule_sync();
        Some(selected)
    }

    /// Tombstone an identity. Without a store there is no deletion to confirm,
    /// so the record is purged right away.
    fn retire(&self, records: &mut RecordStore, id: &str) -> bool {
        if !records.tombstone(id) {
            return false;
        }
        if self.store.is_none() {
            records.purge(&[id.to_string()]);
        }
        true
    }

    fn record_acquisition(&self, outcome: &'static str) {
        metrics::counter!(
            "identity_pool_acquisitions_total",
            "pool" => self.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Clear a lease and re-touch the identity. False if unknown or not leased.
fn unlock(records: &mut RecordStore, id: &str) -> bool {
    match records.get_mut(id) {
        Some(identity) if identity.locked.is_some() => {
            identity.locked = None;
            identity.last_time_used = now_millis();
            true
        }
        _ => false,
    }
}

/// Assembles a `Pool`.
pub struct PoolBuilder {
    name: String,
    options: PoolOptions,
    factory: Option<Arc<dyn IdentityFactory>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
    store: Option<Arc<dyn IdentityStore>>,
}

impl PoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: PoolOptions::default(),
            factory: None,
            classifier: None,
            store: None,
        }
    }

    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn IdentityFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Back the pool with a durable store.
    pub fn store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate options and, for store-backed pools, load the pool's document.
    ///
    /// A store without a document for this pool name is a configuration error.
    pub async fn build(self) -> Result<Pool> {
        if self.name.is_empty() {
            return Err(Error::Config("pool name must not be empty".into()));
        }
        self.options.validate()?;

        let records = match &self.store {
            Some(store) => {
                let doc = store.pull(&self.name, None).await?.ok_or_else(|| {
                    Error::Config(format!("store has no document for pool {}", self.name))
                })?;
                RecordStore::from_document(doc)
            }
            None => RecordStore::new(),
        };

        info!(
            pool = %self.name,
            identities = records.active_len(),
            store_backed = self.store.is_some(),
            creates = self.factory.is_some(),
            "pool initialized"
        );

        Ok(Pool {
            inner: Arc::new(Inner {
                name: self.name,
                options: self.options,
                records: RwLock::new(records),
                factory: self.factory,
                classifier: self.classifier,
                store: self.store,
                availability: Notify::new(),
                creation: Mutex::new(None),
                sync: StdMutex::new(SyncState::default()),
                flush_gate: Mutex::new(()),
            }),
        })
    }
}
