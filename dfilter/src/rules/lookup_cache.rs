// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The hot per-fqdn verdict cache in front of the rule store.
//!
//! Three entry kinds: a cached allow, a cached block, and a negative "no
//! rule" entry that suppresses repeated store lookups for unruled names.
//! Any store change invalidates the whole cache; updates are rare compared
//! to lookups and wildcard changes affect open-ended subdomain sets.

use super::RuleAction;
use clru::CLruCache;
use compact_str::CompactString;
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

/// Default number of cached verdicts.
pub const DEFAULT_CAPACITY: usize = 10_000;
/// Default verdict lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// What the cache remembers about one fqdn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedVerdict {
    /// The resolved action; `None` is the negative "no rule" entry.
    pub action: Option<RuleAction>,
    /// Whether any rule matched. Always false for negative entries.
    pub has_rule: bool,
}

struct VerdictRecord {
    verdict: CachedVerdict,
    inserted: Instant,
}

/// Running counters; cheap enough to keep unconditionally.
#[derive(Debug, Default)]
pub struct LookupCacheStats {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl LookupCacheStats {
    /// Positive hits served.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Negative ("no rule") hits served.
    pub fn negative_hits(&self) -> u64 {
        self.negative_hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to go to the store.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Full invalidations performed.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

/// Bounded LRU of fqdn → verdict with per-entry TTL.
pub struct LookupCache {
    cache: Mutex<CLruCache<CompactString, VerdictRecord>>,
    ttl: Duration,
    stats: LookupCacheStats,
}

impl LookupCache {
    /// Create a cache with the given entry bound and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: Mutex::new(CLruCache::new(capacity)),
            ttl,
            stats: LookupCacheStats::default(),
        }
    }

    /// Look up a verdict. Entries past their TTL are treated as absent.
    pub fn get(&self, domain: &str) -> Option<CachedVerdict> {
        let mut cache = self.cache.lock().unwrap();
        let key = CompactString::from(domain);
        match cache.get(&key) {
            Some(r) if r.inserted.elapsed() <= self.ttl => {
                let verdict = r.verdict;
                if verdict.has_rule {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.negative_hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(verdict)
            }
            Some(_) => {
                cache.pop(&key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remember the resolved action for `domain`.
    pub fn put(&self, domain: &str, action: RuleAction) {
        self.insert(
            domain,
            CachedVerdict {
                action: Some(action),
                has_rule: true,
            },
        );
    }

    /// Remember that no rule matches `domain`.
    pub fn put_negative(&self, domain: &str) {
        self.insert(
            domain,
            CachedVerdict {
                action: None,
                has_rule: false,
            },
        );
    }

    fn insert(&self, domain: &str, verdict: CachedVerdict) {
        self.cache.lock().unwrap().put(
            CompactString::from(domain),
            VerdictRecord {
                verdict,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop every entry. Called on any rule store change.
    pub fn invalidate(&self) {
        self.cache.lock().unwrap().clear();
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter access.
    pub fn stats(&self) -> &LookupCacheStats {
        &self.stats
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_and_negative_entries() {
        let cache = LookupCache::default();
        cache.put("ads.example.com", RuleAction::Block);
        cache.put_negative("plain.example.com");

        let hit = cache.get("ads.example.com").unwrap();
        assert_eq!(hit.action, Some(RuleAction::Block));
        assert!(hit.has_rule);

        let neg = cache.get("plain.example.com").unwrap();
        assert_eq!(neg.action, None);
        assert!(!neg.has_rule);

        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().negative_hits(), 1);
        assert!(cache.get("unseen.example.com").is_none());
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn entries_expire() {
        let cache = LookupCache::new(16, Duration::from_millis(10));
        cache.put("ads.example.com", RuleAction::Block);
        assert!(cache.get("ads.example.com").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("ads.example.com").is_none());
        // The expired record was dropped, not just skipped.
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_within_bound() {
        let cache = LookupCache::new(2, Duration::from_secs(60));
        cache.put("a.com", RuleAction::Block);
        cache.put("b.com", RuleAction::Block);
        // Touch a.com so b.com is the eviction candidate.
        cache.get("a.com");
        cache.put("c.com", RuleAction::Block);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a.com").is_some());
        assert!(cache.get("b.com").is_none());
    }

    #[test]
    fn invalidate_clears_everything() {
        let cache = LookupCache::default();
        cache.put("a.com", RuleAction::Allow);
        cache.put_negative("b.com");
        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations(), 1);
    }
}
