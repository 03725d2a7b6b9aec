//! Advertisement Cache
//!
//! TTL-based registry of which agents provide which resources. Expiry is lazy:
//! an entry past its deadline is simply ignored by lookups until the next
//! [`sweep`](AdvertCache::sweep).

use crate::clock::Clock;
use crate::resource::ResourcePath;
use crate::types::Address;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Resource -> advertiser -> expiry
pub struct AdvertCache {
    entries: HashMap<ResourcePath, HashMap<Address, Instant>>,
    clock: Rc<dyn Clock>,
}

impl AdvertCache {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
        }
    }

    /// Upsert an advertisement. A zero TTL withdraws it.
    pub fn advertise(&mut self, resource: ResourcePath, advertiser: Address, ttl: Duration) {
        if ttl.is_zero() {
            self.withdraw(&resource, &advertiser);
            return;
        }
        let expiry = self.clock.now() + ttl;
        debug!(
            resource = %resource,
            advertiser = %advertiser,
            ttl_secs = ttl.as_secs(),
            "Advertisement refreshed"
        );
        self.entries
            .entry(resource)
            .or_default()
            .insert(advertiser, expiry);
    }

    pub fn withdraw(&mut self, resource: &ResourcePath, advertiser: &Address) {
        if let Some(advertisers) = self.entries.get_mut(resource) {
            advertisers.remove(advertiser);
            if advertisers.is_empty() {
                self.entries.remove(resource);
            }
        }
    }

    /// Live advertisers whose resource contains, or is contained by, `resource`.
    pub fn discover(&self, resource: &ResourcePath) -> BTreeSet<Address> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|(advertised, _)| advertised.overlaps(resource))
            .flat_map(|(_, advertisers)| advertisers.iter())
            .filter(|(_, expiry)| now <= **expiry)
            .map(|(advertiser, _)| advertiser.clone())
            .collect()
    }

    /// Advertisers matching every one of `resources`.
    pub fn discover_all(&self, resources: &[ResourcePath]) -> BTreeSet<Address> {
        let mut iter = resources.iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        let mut candidates = self.discover(first);
        for resource in iter {
            if candidates.is_empty() {
                break;
            }
            let matches = self.discover(resource);
            candidates.retain(|address| matches.contains(address));
        }
        candidates
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.entries.retain(|_, advertisers| {
            let before = advertisers.len();
            advertisers.retain(|_, expiry| now <= *expiry);
            removed += before - advertisers.len();
            !advertisers.is_empty()
        });
        removed
    }

    /// Number of (resource, advertiser) entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
