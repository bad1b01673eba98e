//! Cross-entry SPDY coalescing index (spec §4.5).

use std::collections::HashMap;

use crate::entry::CoalescingKey;
use crate::info::ConnectionInfo;

/// Process-wide (per-manager — spec §9 "Global singleton": "treat the
/// manager as the unit of multitenancy") map from coalescing key to the
/// preferred entry's identity.
#[derive(Debug, Default)]
pub struct SpdyCoalescer {
    preferred: HashMap<CoalescingKey, ConnectionInfo>,
}

impl SpdyCoalescer {
    pub fn new() -> Self {
        SpdyCoalescer {
            preferred: HashMap::new(),
        }
    }

    /// Claim `key` for `info`, or return the entry already holding it (spec
    /// §4.5: "either (a) claims the key... or (b) finds an existing
    /// preferred entry E'").
    pub fn claim_or_lookup(&mut self, key: CoalescingKey, info: &ConnectionInfo) -> ClaimResult {
        match self.preferred.get(&key) {
            Some(existing) if existing != info => ClaimResult::Deferred(existing.clone()),
            Some(_) => ClaimResult::AlreadyOwned,
            None => {
                self.preferred.insert(key, info.clone());
                ClaimResult::Claimed
            }
        }
    }

    pub fn preferred_for(&self, key: &CoalescingKey) -> Option<&ConnectionInfo> {
        self.preferred.get(key)
    }

    pub fn remove(&mut self, key: &CoalescingKey) {
        self.preferred.remove(key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Claimed,
    AlreadyOwned,
    Deferred(ConnectionInfo),
}
