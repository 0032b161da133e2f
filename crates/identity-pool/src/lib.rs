//! Pool of reusable, rate-limited identities
//!
//! Hands out identities (accounts, API keys, sessions) to concurrent workers,
//! enforcing per-identity spacing between uses, exclusive leases with expiry,
//! and a deprecation counter that retires identities after repeated soft
//! failures. When nothing is available the pool creates a new identity
//! through an injected factory, waits for one to free up, or degrades to "no
//! identity", depending on options. Optionally the record set is reconciled
//! with a durable store shared by several pool instances.
//!
//! Identity lifecycle:
//! 1. Factory creates identity (or the store provides one) → `Available`
//! 2. `acquire` selects and touches it → cooling down for `min_interval_between_use`
//! 3. `acquire` with a lease, or `lease` → locked until `release` or `lock_expire`
//! 4. `deprecate` → counter rises; at `max_deprecations_before_removal` it is removed
//! 5. `renew` → counter resets
//! 6. `remove` → tombstoned until the store confirms the deletion

pub mod classify;
mod creator;
pub mod error;
pub mod factory;
pub mod options;
pub mod pool;
mod record;
mod select;
mod sync;

pub use classify::{StatusClassifier, classify_message, classify_status};
pub use error::{Error, Result};
pub use factory::{CreateError, CreateResult, ErrorClassifier, FnClassifier, FnFactory, IdentityFactory};
pub use options::PoolOptions;
pub use pool::{AcquireOptions, Pool, PoolBuilder};
pub use record::{Identity, IdentityRef};
