//! Persisted layout of pool documents
//!
//! The store holds one document per pool name:
//!
//! ```text
//! { <pool>: { "identities": { <id>: { data, deprecated, lastTimeUsed, locked } } } }
//! ```
//!
//! Every identity field is optional on read so that documents written by
//! older or foreign writers still load. Timestamps are unix milliseconds.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Whole store contents, keyed by pool name.
pub type StoreState = HashMap<String, PoolDocument>;

/// One identity as written to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIdentity {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub deprecated: u32,
    #[serde(default)]
    pub last_time_used: u64,
    #[serde(default)]
    pub locked: Option<u64>,
}

/// A pool's durable document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolDocument {
    #[serde(default)]
    pub identities: BTreeMap<String, StoredIdentity>,
}

impl PoolDocument {
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// A merge-write fragment for one pool. `None` deletes the id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolUpdate {
    #[serde(default)]
    pub identities: BTreeMap<String, Option<StoredIdentity>>,
}

impl PoolUpdate {
    /// Apply this fragment onto an existing document.
    pub fn apply_to(self, doc: &mut PoolDocument) {
        for (id, entry) in self.identities {
            match entry {
                Some(identity) => {
                    doc.identities.insert(id, identity);
                }
                None => {
                    doc.identities.remove(&id);
                }
            }
        }
    }
}
