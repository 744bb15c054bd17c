use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::models::user::Application;

/// Hit/miss counters shared by all cache classes. Readers are hot paths,
/// so these are plain relaxed atomics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let h = self.hits() as f64;
        let m = self.misses() as f64;
        if h + m == 0.0 {
            return 0.0;
        }
        h / (h + m)
    }
}

/// Run-lifetime lookup tables: prefecture adjacency and the occupation
/// hierarchy. Warmed once with two bulk queries, then immutable, so
/// parallel scoring workers read without any lock.
#[derive(Debug, Default)]
pub struct AdjacencyCache {
    adjacency: HashMap<String, Vec<String>>,
    major_category: HashMap<i32, i32>,
    stats: CacheStats,
}

impl AdjacencyCache {
    pub fn warm(
        adjacency_rows: Vec<(String, Vec<String>)>,
        occupation_rows: Vec<(i32, i32)>,
    ) -> Self {
        Self {
            adjacency: adjacency_rows.into_iter().collect(),
            major_category: occupation_rows.into_iter().collect(),
            stats: CacheStats::default(),
        }
    }

    pub fn is_adjacent(&self, a: &str, b: &str) -> bool {
        match self.adjacency.get(a) {
            Some(neighbors) => {
                self.stats.hit();
                neighbors.iter().any(|n| n == b)
            }
            None => {
                self.stats.miss();
                false
            }
        }
    }

    /// Full neighbor list for one prefecture. Used to precompute a
    /// per-user adjacency mask before entering the scoring loop.
    pub fn neighbors(&self, pref: &str) -> Option<&[String]> {
        match self.adjacency.get(pref) {
            Some(neighbors) => {
                self.stats.hit();
                Some(neighbors.as_slice())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    /// Major category for an occupation code; unknown codes map to
    /// themselves so a sparse hierarchy degrades to exact-match only.
    pub fn major_of(&self, category_code: i32) -> i32 {
        match self.major_category.get(&category_code) {
            Some(major) => {
                self.stats.hit();
                *major
            }
            None => {
                self.stats.miss();
                category_code
            }
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.adjacency.len() + self.major_category.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompanyPopularity {
    pub application_rate: f32,
    pub applications_7d: i32,
    pub popularity_score: f32,
}

struct PopularityEntry {
    value: CompanyPopularity,
    inserted_at: Instant,
    seq: u64,
}

/// Session cache for company popularity, bucketed by (code, hour) so an
/// hourly rollup upstream invalidates naturally. TTL 1h, LRU capped.
pub struct PopularityCache {
    inner: Mutex<PopularityInner>,
    ttl: Duration,
    capacity: usize,
    stats: CacheStats,
}

struct PopularityInner {
    map: HashMap<(String, i64), PopularityEntry>,
    // Access order queue; stale (key, seq) pairs are skipped on eviction.
    order: VecDeque<((String, i64), u64)>,
    next_seq: u64,
}

impl PopularityCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(PopularityInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            ttl,
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(50_000, Duration::from_secs(3600))
    }

    fn bucket(hour_epoch: i64) -> i64 {
        hour_epoch / 3600
    }

    pub fn get(&self, company_code: &str, now_epoch: i64) -> Option<CompanyPopularity> {
        let key = (company_code.to_string(), Self::bucket(now_epoch));
        let mut inner = self.inner.lock().expect("popularity cache poisoned");
        match inner.map.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.stats.hit();
                let value = entry.value;
                let seq = inner.next_seq;
                inner.next_seq += 1;
                if let Some(e) = inner.map.get_mut(&key) {
                    e.seq = seq;
                }
                inner.order.push_back((key, seq));
                Some(value)
            }
            Some(_) => {
                self.stats.miss();
                inner.map.remove(&key);
                None
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn put(&self, company_code: &str, now_epoch: i64, value: CompanyPopularity) {
        let key = (company_code.to_string(), Self::bucket(now_epoch));
        let mut inner = self.inner.lock().expect("popularity cache poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(
            key.clone(),
            PopularityEntry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
        inner.order.push_back((key, seq));
        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some((key, seq)) => {
                    let live = inner.map.get(&key).map(|e| e.seq) == Some(seq);
                    if live {
                        inner.map.remove(&key);
                    }
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("popularity cache poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Transient per-run cache of user application history. Cleared at the
/// end of every batch.
#[derive(Default)]
pub struct HistoryCache {
    inner: Mutex<HashMap<i64, std::sync::Arc<Vec<Application>>>>,
    stats: CacheStats,
}

impl HistoryCache {
    pub fn get(&self, user_id: i64) -> Option<std::sync::Arc<Vec<Application>>> {
        let inner = self.inner.lock().expect("history cache poisoned");
        match inner.get(&user_id) {
            Some(apps) => {
                self.stats.hit();
                Some(apps.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn put_bulk(&self, histories: HashMap<i64, Vec<Application>>) {
        let mut inner = self.inner.lock().expect("history cache poisoned");
        for (user_id, apps) in histories {
            inner.insert(user_id, std::sync::Arc::new(apps));
        }
    }

    pub fn clear(&self) {
        self.inner.lock().expect("history cache poisoned").clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// All three cache classes, with the combined hit rate the SLO tracks.
pub struct CacheRegistry {
    pub adjacency: AdjacencyCache,
    pub popularity: PopularityCache,
    pub history: HistoryCache,
}

impl CacheRegistry {
    pub fn new(adjacency: AdjacencyCache) -> Self {
        Self {
            adjacency,
            popularity: PopularityCache::with_defaults(),
            history: HistoryCache::default(),
        }
    }

    pub fn combined_hit_rate(&self) -> f64 {
        let hits = self.adjacency.stats().hits()
            + self.popularity.stats().hits()
            + self.history.stats().hits();
        let misses = self.adjacency.stats().misses()
            + self.popularity.stats().misses()
            + self.history.stats().misses();
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjacency() -> AdjacencyCache {
        AdjacencyCache::warm(
            vec![
                ("13".into(), vec!["11".into(), "12".into(), "14".into()]),
                ("14".into(), vec!["13".into(), "22".into()]),
            ],
            vec![(101, 100), (102, 100), (201, 200)],
        )
    }

    #[test]
    fn adjacency_lookup() {
        let cache = adjacency();
        assert!(cache.is_adjacent("13", "14"));
        assert!(!cache.is_adjacent("13", "27"));
        assert!(!cache.is_adjacent("47", "13"));
    }

    #[test]
    fn major_category_falls_back_to_self() {
        let cache = adjacency();
        assert_eq!(cache.major_of(101), 100);
        assert_eq!(cache.major_of(999), 999);
    }

    #[test]
    fn popularity_ttl_and_bucket() {
        let cache = PopularityCache::new(10, Duration::from_secs(3600));
        let now = 1_700_000_000;
        cache.put(
            "C1",
            now,
            CompanyPopularity {
                application_rate: 0.2,
                applications_7d: 12,
                popularity_score: 70.0,
            },
        );
        assert!(cache.get("C1", now).is_some());
        assert!(cache.get("C1", now + 30).is_some());
        // Next hour is a different bucket.
        assert!(cache.get("C1", now + 3600).is_none());
    }

    #[test]
    fn popularity_lru_evicts_oldest() {
        let cache = PopularityCache::new(3, Duration::from_secs(3600));
        let now = 1_700_000_000;
        for code in ["A", "B", "C", "D"] {
            cache.put(code, now, CompanyPopularity::default());
        }
        assert!(cache.len() <= 3);
        assert!(cache.get("D", now).is_some());
        assert!(cache.get("A", now).is_none());
    }

    #[test]
    fn combined_hit_rate_counts_all_classes() {
        let registry = CacheRegistry::new(adjacency());
        registry.adjacency.is_adjacent("13", "14"); // hit
        registry.history.get(42); // miss
        let rate = registry.combined_hit_rate();
        assert!(rate > 0.0 && rate < 1.0);
    }
}
