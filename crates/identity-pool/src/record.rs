//! In-memory record store
//!
//! Maps identity ids to records, preserving insertion order so that
//! selection ties resolve to the first-seen record. A removed identity stays
//! in the map as `Slot::PendingRemoval` until a store round trip confirms the
//! deletion; only then is it purged.

use std::collections::{HashMap, HashSet};

use identity_store::{PoolDocument, PoolUpdate, StoredIdentity};
use serde::Serialize;

/// Current wall-clock time as unix milliseconds.
///
/// Wall-clock rather than monotonic because timestamps are shared through the
/// store with other processes.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Snapshot of one identity as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: String,
    pub data: serde_json::Value,
    /// Soft-failure reports since creation or the last renew.
    pub deprecated: u32,
    /// Unix millis of the last acquisition, touch or release. Zero if never used.
    pub last_time_used: u64,
    /// Unix millis at which the current lease was taken.
    pub locked: Option<u64>,
}

impl Identity {
    /// Fresh, never-used identity around `data`.
    pub(crate) fn new(id: String, data: serde_json::Value) -> Self {
        Self {
            id,
            data,
            deprecated: 0,
            last_time_used: 0,
            locked: None,
        }
    }

    fn from_stored(id: String, stored: StoredIdentity) -> Self {
        Self {
            id,
            data: stored.data,
            deprecated: stored.deprecated,
            last_time_used: stored.last_time_used,
            locked: stored.locked,
        }
    }

    fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            data: self.data.clone(),
            deprecated: self.deprecated,
            last_time_used: self.last_time_used,
            locked: self.locked,
        }
    }
}

/// Mutator input: an id, or a snapshot previously returned by the pool.
#[derive(Debug, Clone, Copy)]
pub enum IdentityRef<'a> {
    ById(&'a str),
    ByRecord(&'a Identity),
}

impl<'a> IdentityRef<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            IdentityRef::ById(id) => id,
            IdentityRef::ByRecord(identity) => &identity.id,
        }
    }
}

impl<'a> From<&'a str> for IdentityRef<'a> {
    fn from(id: &'a str) -> Self {
        IdentityRef::ById(id)
    }
}

impl<'a> From<&'a String> for IdentityRef<'a> {
    fn from(id: &'a String) -> Self {
        IdentityRef::ById(id)
    }
}

impl<'a> From<&'a Identity> for IdentityRef<'a> {
    fn from(identity: &'a Identity) -> Self {
        IdentityRef::ByRecord(identity)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Active(Identity),
    PendingRemoval,
}

/// Ordered id → record map with tombstones.
#[derive(Debug, Default)]
pub(crate) struct RecordStore {
    order: Vec<String>,
    slots: HashMap<String, Slot>,
}

impl RecordStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_document(doc: PoolDocument) -> Self {
        let mut records = Self::new();
        records.merge_loaded(doc);
        records
    }

    /// Insert or replace an active record.
    pub(crate) fn insert(&mut self, identity: Identity) {
        if !self.slots.contains_key(&identity.id) {
            self.order.push(identity.id.clone());
        }
        self.slots
            .insert(identity.id.clone(), Slot::Active(identity));
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Identity> {
        match self.slots.get(id) {
            Some(Slot::Active(identity)) => Some(identity),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Identity> {
        match self.slots.get_mut(id) {
            Some(Slot::Active(identity)) => Some(identity),
            _ => None,
        }
    }

    /// Active records in insertion order.
    pub(crate) fn active(&self) -> impl Iterator<Item = &Identity> {
        self.order.iter().filter_map(|id| self.get(id))
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active().count()
    }

    /// True when the map holds neither records nor tombstones.
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn is_pending_removal(&self, id: &str) -> bool {
        matches!(self.slots.get(id), Some(Slot::PendingRemoval))
    }

    /// Turn an active record into a tombstone. Returns false for unknown ids.
    pub(crate) fn tombstone(&mut self, id: &str) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if matches!(slot, Slot::Active(_)) => {
                *slot = Slot::PendingRemoval;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn pending_removals(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.is_pending_removal(id))
            .cloned()
            .collect()
    }

    /// Drop the given tombstones. Ids that are no longer tombstones are kept.
    pub(crate) fn purge(&mut self, ids: &[String]) -> usize {
        let purged: HashSet<&str> = ids
            .iter()
            .filter(|id| self.is_pending_removal(id))
            .map(String::as_str)
            .collect();
        if purged.is_empty() {
            return 0;
        }
        for id in &purged {
            self.slots.remove(*id);
        }
        self.order.retain(|id| !purged.contains(id.as_str()));
        purged.len()
    }

    /// Full record set as a store fragment; tombstones become deletions.
    pub(crate) fn to_update(&self) -> PoolUpdate {
        let mut update = PoolUpdate::default();
        for id in &self.order {
            let entry = match &self.slots[id] {
                Slot::Active(identity) => Some(identity.to_stored()),
                Slot::PendingRemoval => None,
            };
            update.identities.insert(id.clone(), entry);
        }
        update
    }

    /// Reconcile a document loaded from the store.
    ///
    /// Local state wins field by field. A local record always carries every
    /// field, so only ids unknown locally (neither active nor tombstoned) are
    /// taken from the document. Returns the number of records added.
    pub(crate) fn merge_loaded(&mut self, doc: PoolDocument) -> usize {
        let mut added = 0;
        for (id, stored) in doc.identities {
            if self.slots.contains_key(&id) {
                continue;
            }
            self.insert(Identity::from_stored(id.clone(), stored));
            added += 1;
        }
        added
    }
}
