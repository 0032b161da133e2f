//! Availability rules and recency-based selection
//!
//! An identity is available when its lease is absent or older than
//! `lock_expire`, and its last use is older than `min_interval_between_use`.
//! Among available identities the least recently used wins, or the most
//! recently used when `recently_used_first` is set. Ties go to the first
//! identity in insertion order.

use crate::options::PoolOptions;
use crate::record::Identity;

/// Whether the identity's lease has lapsed (or was never taken).
pub(crate) fn lease_expired(identity: &Identity, options: &PoolOptions, now: u64) -> bool {
    match identity.locked {
        None => true,
        Some(locked) => locked.saturating_add(millis(options.lock_expire)) <= now,
    }
}

/// Whether the identity is still in its usage cooldown.
pub(crate) fn cooling_down(identity: &Identity, options: &PoolOptions, now: u64) -> bool {
    identity
        .last_time_used
        .saturating_add(millis(options.min_interval_between_use))
        > now
}

pub(crate) fn is_available(identity: &Identity, options: &PoolOptions, now: u64) -> bool {
    lease_expired(identity, options, now) && !cooling_down(identity, options, now)
}

/// Pick the best available identity.
pub(crate) fn select<'a>(
    identities: impl Iterator<Item = &'a Identity>,
    options: &PoolOptions,
    now: u64,
) -> Option<&'a Identity> {
    let mut best: Option<&Identity> = None;
    for identity in identities.filter(|i| is_available(i, options, now)) {
        let better = match best {
            None => true,
            Some(current) if options.recently_used_first => {
                identity.last_time_used > current.last_time_used
            }
            Some(current) => identity.last_time_used < current.last_time_used,
        };
        if better {
            best = Some(identity);
        }
    }
    best
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
