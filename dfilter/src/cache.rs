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

//! TTL-aware cache of raw upstream responses, keyed by `(qname, qtype)`.
//!
//! Entries hold the full response bytes; serving rewrites the TTL fields
//! down by the time spent in the cache. The cache is byte-budgeted.

use crate::{codec, MAX_TTL};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use clru::{CLruCache, CLruCacheConfig, WeightScale};
use compact_str::CompactString;
use domain::base::{Message, Rtype};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::hash_map::RandomState,
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Default byte budget: a few MiB of responses.
pub const DEFAULT_BUDGET: usize = 4 * 1024 * 1024;
/// Lookups slower than this count as slow in the statistics.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(10);

type CacheKey = (CompactString, Rtype);

struct CacheRecord {
    response: Bytes,
    fetched: Instant,
    expires: Instant,
    // Wall-clock twin of `fetched`, only for persistence.
    fetched_wall: DateTime<Utc>,
    effective_ttl: u32,
    original_ttl: u32,
}

/// One serialized cache entry, the unit of the file-per-entry disk layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedResponse {
    /// Lower-cased query name.
    pub qname: String,
    /// Query type as its wire value.
    pub qtype: u16,
    /// When the response was fetched.
    pub fetched: DateTime<Utc>,
    /// Effective (capped) lifetime in seconds.
    pub ttl: u32,
    /// TTL as the upstream sent it.
    pub original_ttl: u32,
    /// Hex-encoded raw response bytes.
    pub response: String,
}

struct RespWeight;

impl WeightScale<CacheKey, CacheRecord> for RespWeight {
    fn weight(&self, key: &CacheKey, value: &CacheRecord) -> usize {
        key.0.len() + value.response.len()
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    hits: u64,
    misses: u64,
    evictions: u64,
    slow_lookups: u64,
    lookup_total: Duration,
    lookup_count: u64,
    fastest: Option<Duration>,
    slowest: Option<Duration>,
}

/// A point-in-time statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    /// Served from cache.
    pub hits: u64,
    /// Not present or expired.
    pub misses: u64,
    /// Entries pushed out by the byte budget.
    pub evictions: u64,
    /// hits / (hits + misses), zero when idle.
    pub hit_rate: f64,
    /// Fastest lookup seen.
    pub fastest_lookup: Option<Duration>,
    /// Slowest lookup seen.
    pub slowest_lookup: Option<Duration>,
    /// Mean lookup time.
    pub average_lookup: Option<Duration>,
    /// Lookups above the slow threshold.
    pub slow_lookups: u64,
    /// Entries currently cached.
    pub entries: usize,
}

/// The response cache.
pub struct ResponseCache {
    cache: Mutex<CLruCache<CacheKey, CacheRecord, RandomState, RespWeight>>,
    max_ttl: u32,
    slow_threshold: Duration,
    stats: Mutex<StatsInner>,
}

impl ResponseCache {
    /// Create a cache bounded to roughly `budget_bytes` of responses, capping
    /// stored TTLs at `max_ttl` seconds.
    pub fn new(budget_bytes: usize, max_ttl: u32, slow_threshold: Duration) -> Self {
        let budget = NonZeroUsize::new(budget_bytes.max(1)).unwrap();
        Self {
            cache: Mutex::new(CLruCache::with_config(
                CLruCacheConfig::new(budget).with_scale(RespWeight),
            )),
            max_ttl: max_ttl.min(MAX_TTL),
            slow_threshold,
            stats: Mutex::new(StatsInner::default()),
        }
    }

    /// Store an upstream response. Erroneous responses are not cached; the
    /// stored lifetime is `min(upstream TTL, configured max)`.
    pub fn put(&self, qname: &str, qtype: Rtype, response: Bytes) {
        let msg = match Message::from_octets(response.clone()) {
            Ok(m) => m,
            Err(_) => return,
        };
        if !msg.no_error() {
            info!("response errored, not caching erroneous upstream response.");
            return;
        }
        let upstream_ttl = codec::min_ttl(&msg).unwrap_or(self.max_ttl);
        let ttl = upstream_ttl.min(self.max_ttl);
        if ttl == 0 {
            return;
        }
        let now = Instant::now();
        let record = CacheRecord {
            response,
            fetched: now,
            expires: now + Duration::from_secs(u64::from(ttl)),
            fetched_wall: Utc::now(),
            effective_ttl: ttl,
            original_ttl: upstream_ttl,
        };
        let key = (CompactString::from(qname), qtype);

        let mut cache = self.cache.lock().unwrap();
        let before = cache.len();
        let existed = cache.peek(&key).is_some();
        if cache.put_with_weight(key, record).is_err() {
            info!("response for {} too large to cache", qname);
            return;
        }
        let after = cache.len();
        let evicted = (before + usize::from(!existed)).saturating_sub(after);
        if evicted > 0 {
            self.stats.lock().unwrap().evictions += evicted as u64;
        }
    }

    /// Fetch a cached response with decayed TTLs. Expired entries are misses
    /// and are dropped on the way out.
    pub fn get(&self, qname: &str, qtype: Rtype) -> Option<Bytes> {
        let started = Instant::now();
        let key = (CompactString::from(qname), qtype);
        let mut cache = self.cache.lock().unwrap();
        let result = match cache.get(&key) {
            Some(r) if started < r.expires => {
                let elapsed = started.saturating_duration_since(r.fetched).as_secs() as u32;
                codec::decay_ttl(&r.response, elapsed).ok()
            }
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        };
        drop(cache);
        self.record_lookup(started.elapsed(), result.is_some());
        result
    }

    /// The original (undecayed) TTL stored for an entry, for inspection.
    pub fn original_ttl(&self, qname: &str, qtype: Rtype) -> Option<u32> {
        let key = (CompactString::from(qname), qtype);
        self.cache
            .lock()
            .unwrap()
            .peek(&key)
            .map(|r| r.original_ttl)
    }

    fn record_lookup(&self, elapsed: Duration, hit: bool) {
        let mut stats = self.stats.lock().unwrap();
        if hit {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        if elapsed > self.slow_threshold {
            stats.slow_lookups += 1;
        }
        stats.lookup_total += elapsed;
        stats.lookup_count += 1;
        stats.fastest = Some(stats.fastest.map_or(elapsed, |f| f.min(elapsed)));
        stats.slowest = Some(stats.slowest.map_or(elapsed, |s| s.max(elapsed)));
    }

    /// Drop everything; used on explicit clears and on VPN path changes,
    /// where cached answers may come from the wrong split-horizon view.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Sweep entries past their expiry.
    pub fn remove_expired(&self) {
        let mut cache = self.cache.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, r)| now >= r.expires)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            cache.pop(&key);
        }
    }

    /// Serialize every live entry for the on-disk cache.
    pub fn export(&self) -> Vec<PersistedResponse> {
        let cache = self.cache.lock().unwrap();
        let now = Instant::now();
        cache
            .iter()
            .filter(|(_, r)| now < r.expires)
            .map(|((qname, qtype), r)| PersistedResponse {
                qname: qname.to_string(),
                qtype: qtype.to_int(),
                fetched: r.fetched_wall,
                ttl: r.effective_ttl,
                original_ttl: r.original_ttl,
                response: hex::encode(&r.response),
            })
            .collect()
    }

    /// Re-insert persisted entries, skipping anything already expired.
    pub fn import(&self, entries: Vec<PersistedResponse>) {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut cache = self.cache.lock().unwrap();
        for entry in entries {
            let age = (wall_now - entry.fetched).num_seconds();
            if age < 0 {
                continue;
            }
            let Some(remaining) = entry.ttl.checked_sub(age as u32) else {
                continue;
            };
            if remaining == 0 {
                continue;
            }
            let Ok(raw) = hex::decode(&entry.response) else {
                continue;
            };
            let record = CacheRecord {
                response: Bytes::from(raw),
                fetched: now
                    .checked_sub(Duration::from_secs(age as u64))
                    .unwrap_or(now),
                expires: now + Duration::from_secs(u64::from(remaining)),
                fetched_wall: entry.fetched,
                effective_ttl: entry.ttl,
                original_ttl: entry.original_ttl,
            };
            let key = (CompactString::from(entry.qname.as_str()), Rtype::from_int(entry.qtype));
            let _ = cache.put_with_weight(key, record);
        }
    }

    /// Entries currently cached.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let stats = self.stats.lock().unwrap();
        let looked = stats.hits + stats.misses;
        CacheStats {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            hit_rate: if looked == 0 {
                0.0
            } else {
                stats.hits as f64 / looked as f64
            },
            fastest_lookup: stats.fastest,
            slowest_lookup: stats.slowest,
            average_lookup: (stats.lookup_count > 0)
                .then(|| stats.lookup_total / stats.lookup_count as u32),
            slow_lookups: stats.slow_lookups,
            entries: self.len(),
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET, MAX_TTL, DEFAULT_SLOW_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::parse_query, mock::build_query};
    use domain::rdata::A;
    use std::net::Ipv4Addr;

    fn response_for(name: &str, ttl: u32) -> Bytes {
        let query = build_query(name, Rtype::A, 1);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        let resp = crate::codec::blocked_a(&parsed, Ipv4Addr::new(1, 2, 3, 4), ttl).unwrap();
        Bytes::copy_from_slice(resp.as_slice())
    }

    #[test]
    fn hit_returns_same_answer() {
        let cache = ResponseCache::default();
        cache.put("cdn.example.com", Rtype::A, response_for("cdn.example.com", 300));

        let served = cache.get("cdn.example.com", Rtype::A).unwrap();
        let msg = Message::from_octets(served).unwrap();
        let answer = msg.answer().unwrap().next().unwrap().unwrap();
        let a = answer.into_record::<A>().unwrap().unwrap();
        assert_eq!(a.data().addr(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn ttl_is_capped_by_max() {
        let cache = ResponseCache::new(DEFAULT_BUDGET, 60, DEFAULT_SLOW_THRESHOLD);
        cache.put("cdn.example.com", Rtype::A, response_for("cdn.example.com", 4000));
        assert_eq!(cache.original_ttl("cdn.example.com", Rtype::A), Some(4000));
        // A fresh get still serves the upstream TTL values; only the expiry
        // is capped, which we can't fast-forward here. Presence is enough.
        assert!(cache.get("cdn.example.com", Rtype::A).is_some());
    }

    #[test]
    fn miss_kinds() {
        let cache = ResponseCache::default();
        assert!(cache.get("nothere.example.com", Rtype::A).is_none());
        cache.put("a.example.com", Rtype::A, response_for("a.example.com", 300));
        // Different qtype is a different key.
        assert!(cache.get("a.example.com", Rtype::Aaaa).is_none());
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn zero_ttl_and_errors_are_not_cached() {
        let cache = ResponseCache::default();
        cache.put("z.example.com", Rtype::A, response_for("z.example.com", 0));
        assert!(cache.is_empty());

        let query = build_query("e.example.com", Rtype::A, 5);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        let nx = crate::codec::nxdomain(&parsed).unwrap();
        cache.put(
            "e.example.com",
            Rtype::A,
            Bytes::copy_from_slice(nx.as_slice()),
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn byte_budget_evicts_lru() {
        // Budget fits two of these responses but not three.
        let sample = response_for("a.example.com", 300);
        let cache = ResponseCache::new(sample.len() * 5 / 2, MAX_TTL, DEFAULT_SLOW_THRESHOLD);
        cache.put("a.example.com", Rtype::A, response_for("a.example.com", 300));
        cache.put("b.example.com", Rtype::A, response_for("b.example.com", 300));
        cache.get("a.example.com", Rtype::A);
        cache.put("c.example.com", Rtype::A, response_for("c.example.com", 300));

        assert!(cache.get("a.example.com", Rtype::A).is_some());
        assert!(cache.get("b.example.com", Rtype::A).is_none());
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = ResponseCache::default();
        cache.put("s.example.com", Rtype::A, response_for("s.example.com", 1));
        assert!(cache.get("s.example.com", Rtype::A).is_some());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get("s.example.com", Rtype::A).is_none());
        // The expired record is gone, not lingering.
        assert!(cache.is_empty());
    }

    #[test]
    fn persistence_roundtrip_preserves_remaining_ttl() {
        let cache = ResponseCache::default();
        cache.put("p.example.com", Rtype::A, response_for("p.example.com", 300));
        let exported = cache.export();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].qname, "p.example.com");
        assert_eq!(exported[0].ttl, 300);

        let restored = ResponseCache::default();
        restored.import(exported);
        assert_eq!(restored.len(), 1);
        assert!(restored.get("p.example.com", Rtype::A).is_some());

        // An entry that aged past its TTL on disk never comes back.
        let mut stale = cache.export();
        stale[0].fetched = Utc::now() - chrono::Duration::seconds(301);
        let empty = ResponseCache::default();
        empty.import(stale);
        assert!(empty.is_empty());
    }

    #[test]
    fn clear_and_len() {
        let cache = ResponseCache::default();
        cache.put("a.example.com", Rtype::A, response_for("a.example.com", 300));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
