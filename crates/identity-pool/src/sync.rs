//! Debounced store synchronization
//!
//! Mutations mark the pool dirty and make sure a flush is scheduled. The first
//! mutation after a quiet period flushes right away; mutations arriving within
//! `min_interval_between_store_update` of the last flush collapse into one
//! trailing flush at the end of the window. A single background task drives
//! the flushes, and a gate keeps at most one round trip in flight.
//!
//! A flush pushes the full record set (or, for an empty pool, just reloads the
//! store) and reconciles the store's answer into memory. Tombstones included in
//! the push are purged only when the round trip succeeds. Failures are logged
//! and leave local state untouched; the next scheduled flush retries.

use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::pool::Inner;

/// Flush bookkeeping shared by mutators and the flush task.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    dirty: bool,
    scheduled: bool,
    last_flush: Option<Instant>,
}

impl SyncState {
    fn delay_before_flush(&self, interval: Duration) -> Duration {
        self.last_flush
            .map(|at| interval.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

impl Inner {
    /// Mark the pool dirty and ensure a flush is on its way.
    pub(crate) fn schedule_sync(self: &Arc<Self>) {
        if self.store.is_none() {
            return;
        }
        let delay = {
            let mut state = self.sync.lock().unwrap_or_else(PoisonError::into_inner);
            state.dirty = true;
            if state.scheduled {
                return;
            }
            state.scheduled = true;
            state.delay_before_flush(self.options.min_interval_between_store_update)
        };
        debug!(pool = %self.name, delay_ms = delay.as_millis() as u64, "store sync scheduled");
        tokio::spawn(run_scheduled_flushes(Arc::downgrade(self), delay));
    }

    /// One store round trip. At most one runs at a time.
    pub(crate) async fn flush(&self) -> identity_store::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _gate = self.flush_gate.lock().await;

        let (update, removals) = {
            let records = self.records.read().await;
            if records.is_empty() {
                (None, Vec::new())
            } else {
                (Some(records.to_update()), records.pending_removals())
            }
        };

        let result = match update {
            Some(update) => store.push(&self.name, update).await,
            None => store
                .pull(&self.name, None)
                .await
                .map(Option::unwrap_or_default),
        };

        match result {
            Ok(doc) => {
                let (purged, added) = {
                    let mut records = self.records.write().await;
                    (records.purge(&removals), records.merge_loaded(doc))
                };
                if added > 0 {
                    self.availability.notify_waiters();
                }
                self.record_sync("ok");
                debug!(pool = %self.name, purged, added, "store sync complete");
                Ok(())
            }
            Err(e) => {
                self.record_sync("error");
                Err(e)
            }
        }
    }

    fn record_sync(&self, result: &'static str) {
        metrics::counter!(
            "identity_pool_syncs_total",
            "pool" => self.name.clone(),
            "result" => result
        )
        .increment(1);
    }
}

/// Flush loop spawned by `schedule_sync`. Exits once nothing is dirty or the
/// pool has been dropped.
async fn run_scheduled_flushes(pool: Weak<Inner>, mut delay: Duration) {
    loop {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let Some(inner) = pool.upgrade() else {
            return;
        };

        {
            let mut state = inner.sync.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.dirty {
                state.scheduled = false;
                return;
            }
            state.dirty = false;
        }

        let result = inner.flush().await;

        let next = {
            let mut state = inner.sync.lock().unwrap_or_else(PoisonError::into_inner);
            state.last_flush = Some(Instant::now());
            match result {
                Err(e) => {
                    // Changes stay pending; the next mutation schedules another attempt
                    state.dirty = true;
                    state.scheduled = false;
                    warn!(pool = %inner.name, error = %e, "store sync failed, keeping local state");
                    None
                }
                Ok(()) if !state.dirty => {
                    state.scheduled = false;
                    None
                }
                Ok(()) => Some(
                    state.delay_before_flush(inner.options.min_interval_between_store_update),
                ),
            }
        };
        match next {
            Some(next_delay) => delay = next_delay,
            None => return,
        }
    }
}
