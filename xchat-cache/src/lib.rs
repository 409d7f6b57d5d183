//! Freshness-aware query cache in front of a [`DataSource`].
//!
//! Every lookup reads the source's freshness token first; an entry is only
//! served while the token it was fetched under is still current. Concurrent
//! misses on one canonical key collapse onto a single gateway fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use xchat_store::{DataSource, GatewayError};
use xchat_types::{CacheKey, FreshnessToken, QueryDescriptor, Row};

mod table;
use table::{EntryTable, Found};

/// A cached answer to one descriptor. Owned by the cache; readers only ever
/// see the shared `rows`.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub descriptor: QueryDescriptor,
    pub rows: Arc<Vec<Row>>,
    pub token: FreshnessToken,
    pub inserted_at: Instant,
}

#[derive(Clone, Debug)]
pub struct CacheLookup {
    pub rows: Arc<Vec<Row>>,
    pub from_cache: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_refreshes: u64,
    pub coalesced: u64,
    pub fetches: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_refreshes: AtomicU64,
    coalesced: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct QueryCache {
    source: Arc<dyn DataSource>,
    capacity: usize,
    table: Mutex<EntryTable>,
    /// One async mutex per key with a lookup past the fast path.
    inflight: Mutex<HashMap<CacheKey, KeyLock>>,
    counters: Counters,
}

impl QueryCache {
    pub fn new(source: Arc<dyn DataSource>, capacity: usize) -> Self {
        Self {
            source,
            capacity: capacity.max(1),
            table: Mutex::new(EntryTable::new()),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    /// Return rows for `descriptor`, from the cache when the stored freshness
    /// token is still current, otherwise from the gateway.
    ///
    /// Gateway errors are returned unchanged and nothing is cached for them.
    pub async fn get_or_fetch(&self, descriptor: &QueryDescriptor) -> Result<CacheLookup, GatewayError> {
        let key = descriptor.cache_key();
        let token = self
            .source
            .freshness_token(&descriptor.raw_data_source)
            .await?;

        if let Some(rows) = self.fresh_rows(&key, token, descriptor) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cache_key = %key, source = %descriptor.raw_data_source, %token, "cache hit");
            return Ok(CacheLookup {
                rows,
                from_cache: true,
            });
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let flight = self.join_flight(&key);
        let _exclusive = flight.lock.lock().await;

        // Whoever held the key before us may have filled it, or the source
        // may have moved on while we waited.
        let token = self
            .source
            .freshness_token(&descriptor.raw_data_source)
            .await?;
        if let Some(rows) = self.fresh_rows(&key, token, descriptor) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cache_key = %key, "collapsed onto in-flight fetch");
            return Ok(CacheLookup {
                rows,
                from_cache: true,
            });
        }

        // Nothing is stored for `key` until the fetch returns, so an
        // in-flight key has no entry for eviction to pick.
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let fetched = self.source.fetch(descriptor).await;

        let rows = match fetched {
            Ok(rows) => Arc::new(rows),
            Err(e) => {
                tracing::warn!(cache_key = %key, source = %descriptor.raw_data_source, error = %e, "gateway fetch failed");
                return Err(e);
            }
        };

        let evicted = {
            let mut table = lock(&self.table);
            // The token read before the fetch: if the source changed
            // mid-fetch the next lookup sees a mismatch and refetches.
            table.insert(
                key.clone(),
                CacheEntry {
                    descriptor: descriptor.clone(),
                    rows: Arc::clone(&rows),
                    token,
                    inserted_at: Instant::now(),
                },
            );
            table.evict_to(self.capacity, Some(&key))
        };
        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            tracing::debug!(evicted = evicted.len(), "lru eviction");
        }

        tracing::info!(
            cache_key = %key,
            source = %descriptor.raw_data_source,
            %token,
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetched from source"
        );
        Ok(CacheLookup {
            rows,
            from_cache: false,
        })
    }

    /// Drop every entry read from `source`.
    pub fn invalidate_source(&self, source: &str) -> usize {
        let removed = lock(&self.table).remove_source(source);
        if removed > 0 {
            tracing::info!(source, removed, "cache invalidated");
        }
        removed
    }

    pub fn contains(&self, descriptor: &QueryDescriptor) -> bool {
        lock(&self.table).contains(&descriptor.cache_key())
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_refreshes: self.counters.stale_refreshes.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Fresh rows for `key`, in the column order `descriptor` asked for.
    fn fresh_rows(&self, key: &CacheKey, token: FreshnessToken, descriptor: &QueryDescriptor) -> Option<Arc<Vec<Row>>> {
        let found = lock(&self.table).lookup(key, token);
        match found {
            Found::Hit { rows, columns } => Some(reorder(rows, &columns, &descriptor.columns)),
            Found::Stale => {
                self.counters.stale_refreshes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, %token, "stale entry dropped");
                None
            }
            Found::Missing => None,
        }
    }

    fn join_flight(&self, key: &CacheKey) -> Flight<'_> {
        let lock = {
            let mut map = lock(&self.inflight);
            Arc::clone(map.entry(key.clone()).or_default())
        };
        Flight {
            cache: self,
            key: key.clone(),
            lock,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Membership in a key's single-flight group. The last member to leave
/// removes the key's mutex from the map, including when the owning future
/// is dropped mid-fetch.
struct Flight<'a> {
    cache: &'a QueryCache,
    key: CacheKey,
    lock: KeyLock,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let mut map = lock(&self.cache.inflight);
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

/// Rows stored under `stored` column order, rearranged into `requested`.
/// Column order is not part of the cache key, so two descriptors that share
/// an entry may want the same columns in different orders.
fn reorder(rows: Arc<Vec<Row>>, stored: &[String], requested: &[String]) -> Arc<Vec<Row>> {
    if requested.is_empty() || stored == requested {
        return rows;
    }
    let reordered = rows
        .iter()
        .map(|row| {
            let mut out = Row::new();
            for column in requested {
                if let Some(v) = row.get(column) {
                    out.insert(column.clone(), v.clone());
                }
            }
            out
        })
        .collect();
    Arc::new(reordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::future::join_all;
    use serde_json::json;
    use xchat_store::InMemoryDataSource;
    use xchat_types::FilterOp;

    fn rows(values: &[serde_json::Value]) -> Vec<Row> {
        values
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    async fn source(latency: Duration) -> Arc<InMemoryDataSource> {
        let source = InMemoryDataSource::new().with_latency(latency);
        source
            .replace_table(
                "sales_table",
                rows(&[
                    json!({"Date": "2026-02-01", "Product A": 61.0, "Product B": 70.5}),
                    json!({"Date": "2026-02-02", "Product A": 58.2, "Product B": 72.1}),
                ]),
            )
            .await;
        Arc::new(source)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src.clone(), 8);
        let d = QueryDescriptor::new("sales_table").columns(["Date"]);

        let first = cache.get_or_fetch(&d).await.unwrap();
        assert!(!first.from_cache);
        let second = cache.get_or_fetch(&d).await.unwrap();
        assert!(second.from_cache);
        assert!(Arc::ptr_eq(&first.rows, &second.rows));
        assert_eq!(src.fetch_count(), 1);
    }

    #[tokio::test]
    async fn equivalent_descriptors_share_one_entry() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src.clone(), 8);
        let a = QueryDescriptor::new("sales_table")
            .filter("Product A", FilterOp::Gt, 50)
            .filter("Date", FilterOp::Gte, "2026-02-01");
        let b = QueryDescriptor::new("sales_table")
            .filter("Date", FilterOp::Gte, "2026-02-01")
            .filter("Product A", FilterOp::Gt, 50);

        let first = cache.get_or_fetch(&a).await.unwrap();
        let second = cache.get_or_fetch(&b).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert!(Arc::ptr_eq(&first.rows, &second.rows));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn hits_keep_the_requested_column_order() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src.clone(), 8);
        let date_first = QueryDescriptor::new("sales_table").columns(["Date", "Product A"]);
        let product_first = QueryDescriptor::new("sales_table").columns(["Product A", "Date"]);

        let first = cache.get_or_fetch(&date_first).await.unwrap();
        let second = cache.get_or_fetch(&product_first).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(src.fetch_count(), 1);
        let keys: Vec<&String> = second.rows[0].keys().collect();
        assert_eq!(keys, vec!["Product A", "Date"]);
        assert_eq!(first.rows[0]["Product A"], second.rows[0]["Product A"]);

        let again = cache.get_or_fetch(&date_first).await.unwrap();
        assert!(Arc::ptr_eq(&first.rows, &again.rows));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn collapsed_waiters_keep_their_column_order() {
        let src = source(Duration::from_millis(50)).await;
        let cache = Arc::new(QueryCache::new(src.clone(), 8));
        let date_first = QueryDescriptor::new("sales_table").columns(["Date", "Product B"]);
        let product_first = QueryDescriptor::new("sales_table").columns(["Product B", "Date"]);

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_fetch(&date_first).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiter = cache.get_or_fetch(&product_first).await.unwrap();
        let leader = leader.await.unwrap().unwrap();

        assert_eq!(src.fetch_count(), 1);
        assert!(!leader.from_cache);
        assert!(waiter.from_cache);
        let keys: Vec<&String> = waiter.rows[0].keys().collect();
        assert_eq!(keys, vec!["Product B", "Date"]);
        let keys: Vec<&String> = leader.rows[0].keys().collect();
        assert_eq!(keys, vec!["Date", "Product B"]);
    }

    #[tokio::test]
    async fn changed_token_triggers_exactly_one_refetch() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src.clone(), 8);
        let d = QueryDescriptor::new("sales_table").columns(["Product A"]);

        let before = cache.get_or_fetch(&d).await.unwrap();
        src.replace_table("sales_table", rows(&[json!({"Product A": 99.0})]))
            .await;

        let after = cache.get_or_fetch(&d).await.unwrap();
        assert!(!after.from_cache);
        assert_eq!(after.rows.len(), 1);
        assert_ne!(*before.rows, *after.rows);
        assert_eq!(src.fetch_count(), 2);

        let again = cache.get_or_fetch(&d).await.unwrap();
        assert!(again.from_cache);
        assert_eq!(src.fetch_count(), 2);
        assert_eq!(cache.stats().stale_refreshes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cold_lookups_collapse_into_one_fetch() {
        let src = source(Duration::from_millis(50)).await;
        let cache = Arc::new(QueryCache::new(src.clone(), 8));
        let d = QueryDescriptor::new("sales_table").columns(["Date", "Product B"]);

        let calls = (0..16).map(|_| {
            let cache = Arc::clone(&cache);
            let d = d.clone();
            tokio::spawn(async move { cache.get_or_fetch(&d).await })
        });
        let results = join_all(calls).await;

        let lookups: Vec<CacheLookup> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(src.fetch_count(), 1);
        assert_eq!(lookups.iter().filter(|l| !l.from_cache).count(), 1);
        assert!(lookups.iter().all(|l| Arc::ptr_eq(&l.rows, &lookups[0].rows)));
        assert!(lock(&cache.inflight).is_empty());
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used_and_readers_keep_their_rows() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src.clone(), 2);
        let a = QueryDescriptor::new("sales_table").limit(1);
        let b = QueryDescriptor::new("sales_table").limit(2);
        let c = QueryDescriptor::new("sales_table").offset(1);

        cache.get_or_fetch(&a).await.unwrap();
        let held = cache.get_or_fetch(&b).await.unwrap();
        assert!(cache.get_or_fetch(&a).await.unwrap().from_cache);
        cache.get_or_fetch(&c).await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
        // The evicted entry's rows are still readable by whoever holds them.
        assert_eq!(held.rows.len(), 2);
    }

    struct FlakySource {
        inner: Arc<InMemoryDataSource>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl DataSource for FlakySource {
        async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Row>, GatewayError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GatewayError::SourceUnavailable("warehouse restarting".into()));
            }
            self.inner.fetch(descriptor).await
        }

        async fn freshness_token(&self, source: &str) -> Result<FreshnessToken, GatewayError> {
            self.inner.freshness_token(source).await
        }
    }

    #[tokio::test]
    async fn failed_fetches_are_not_cached() {
        let inner = source(Duration::ZERO).await;
        let flaky = Arc::new(FlakySource {
            inner,
            failures_left: AtomicUsize::new(1),
        });
        let cache = QueryCache::new(flaky, 8);
        let d = QueryDescriptor::new("sales_table");

        let err = cache.get_or_fetch(&d).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.is_empty());

        let ok = cache.get_or_fetch(&d).await.unwrap();
        assert!(!ok.from_cache);
        assert_eq!(ok.rows.len(), 2);
    }

    #[tokio::test]
    async fn invalid_descriptor_propagates_unchanged() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src, 8);
        let d = QueryDescriptor::new("sales_table").columns(["Revenue"]);
        assert!(matches!(
            cache.get_or_fetch(&d).await,
            Err(GatewayError::InvalidDescriptor(_))
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_source_forces_a_refetch() {
        let src = source(Duration::ZERO).await;
        let cache = QueryCache::new(src.clone(), 8);
        let d = QueryDescriptor::new("sales_table");
        cache.get_or_fetch(&d).await.unwrap();
        assert_eq!(cache.invalidate_source("sales_table"), 1);
        assert!(!cache.get_or_fetch(&d).await.unwrap().from_cache);
        assert_eq!(src.fetch_count(), 2);
    }
}
