//! Single-flight identity creation
//!
//! At most one creation-or-wait attempt runs per pool. The attempt lives in
//! an in-flight slot as a shared future; callers that find the pool exhausted
//! while an attempt is running attach to it and observe the same outcome.
//! The slot clears when the attempt settles.
//!
//! One attempt:
//! 1. Call the factory until it yields a payload, the retry budget is spent,
//!    or a failure the classifier does not excuse aborts the attempt.
//! 2. When exhausted: degrade to "no identity", poll for an existing identity
//!    to free up, block on the store for new identities, or fail.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use identity_store::WaitCondition;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pool::Inner;
use crate::record::Identity;

/// What the acquiring caller should do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Scan the pool again.
    Retry,
    /// Give up and proceed without an identity.
    NoIdentity,
}

pub(crate) type AttemptFuture = Shared<BoxFuture<'static, Result<Attempt>>>;

impl Inner {
    /// Run, or attach to, the pool's creation attempt.
    pub(crate) async fn create_or_wait(self: &Arc<Self>) -> Result<Attempt> {
        let attempt = {
            let mut slot = self.creation.lock().await;
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!(pool = %self.name, "attaching to in-flight creation attempt");
                    in_flight.clone()
                }
                None => {
                    let inner = Arc::clone(self);
                    let attempt = async move {
                        let outcome = inner.run_attempt().await;
                        inner.creation.lock().await.take();
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    async fn run_attempt(self: &Arc<Self>) -> Result<Attempt> {
        let mut trials: u32 = 0;

        if let Some(factory) = &self.factory {
            let budget = self.options.retry_budget();
            loop {
                match factory.create().await {
                    Ok(Some(data)) if !data.is_null() => {
                        let identity = self.add_created(data).await;
                        info!(pool = %self.name, identity_id = %identity.id, trials, "identity created");
                        self.record_creation("created");
                        return Ok(Attempt::Retry);
                    }
                    Ok(_) => {
                        debug!(pool = %self.name, trials, "factory produced no identity");
                        self.record_creation("empty");
                    }
                    Err(e) => {
                        let explanation = match &self.classifier {
                            Some(classifier) => classifier.classify(&e).await,
                            None => None,
                        };
                        match explanation.filter(|reason| !reason.is_empty()) {
                            Some(reason) => {
                                warn!(pool = %self.name, error = %e, reason, trials, "identity creation failed, retrying");
                                self.record_creation("retryable_error");
                            }
                            None => {
                                error!(pool = %self.name, error = %e, trials, "identity creation failed");
                                self.record_creation("fatal_error");
                                return Err(Error::Create(e));
                            }
                        }
                    }
                }

                trials += 1;
                if budget.is_some_and(|max| trials > max) {
                    break;
                }
                let delay = self.options.retry_delay(trials);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.on_exhausted(trials).await
    }

    async fn add_created(self: &Arc<Self>, data: serde_json::Value) -> Identity {
        let identity = Identity::new(uuid::Uuid::new_v4().as_simple().to_string(), data);
        self.records.write().await.insert(identity.clone());
        self.schedule_sync();
        identity
    }

    async fn on_exhausted(self: &Arc<Self>, trials: u32) -> Result<Attempt> {
        if self.options.allow_no_identity {
            info!(pool = %self.name, trials, "no identity available, proceeding without one");
            return Ok(Attempt::NoIdentity);
        }

        let (active, pending) = {
            let records = self.records.read().await;
            let pending: HashSet<String> = records.pending_removals().into_iter().collect();
            (records.active_len(), pending)
        };
        let poll = self.options.polling_interval_waiting_for_available;

        if active > 0 && !poll.is_zero() {
            debug!(
                pool = %self.name,
                identities = active,
                poll_ms = poll.as_millis() as u64,
                "all identities busy, waiting for one to become available"
            );
            tokio::select! {
                _ = self.availability.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            return Ok(Attempt::Retry);
        }

        if active == 0 && self.options.wait_for_store_update_when_no_identity {
            if let Some(store) = &self.store {
                // Identities this pool already removed do not count as new ones
                let wait = WaitCondition::new(
                    format!("waiting for store to provide identities for pool {}", self.name),
                    move |doc| {
                        doc.is_some_and(|d| d.identities.keys().any(|id| !pending.contains(id)))
                    },
                );
                let doc = store.pull(&self.name, Some(wait)).await?;
                let added = self.records.write().await.merge_loaded(doc.unwrap_or_default());
                info!(pool = %self.name, added, "store provided identities");
                return Ok(Attempt::Retry);
            }
        }

        warn!(pool = %self.name, trials, identities = active, "pool exhausted");
        Err(Error::Exhausted {
            pool: self.name.clone(),
            trials,
            reason: if active == 0 {
                "pool is empty and no identity could be created".into()
            } else {
                "every identity is leased or cooling down and polling is disabled".into()
            },
        })
    }

    fn record_creation(&self, result: &'static str) {
        metrics::counter!(
            "identity_pool_creations_total",
            "pool" => self.name.clone(),
            "result" => result
        )
        .increment(1);
    }
}
