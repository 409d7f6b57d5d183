use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use xchat_types::Row;

use crate::{LlmEngine, LlmError};

/// Insights keyed by a content hash of `(chart type, rows)`.
///
/// Identical data never pays for a second model call. Oldest entries are
/// dropped first once `capacity` is reached.
pub struct InsightCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl InsightCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(chart_type: &str, rows: &[Row]) -> String {
        let mut h = Sha256::new();
        h.update(chart_type.as_bytes());
        h.update([0u8]);
        for row in rows {
            h.update(serde_json::Value::Object(row.clone()).to_string().as_bytes());
            h.update([b'\n']);
        }
        format!("{:x}", h.finalize())
    }

    pub async fn get_or_generate(
        &self,
        engine: &dyn LlmEngine,
        chart_type: &str,
        rows: &[Row],
    ) -> Result<String, LlmError> {
        let key = Self::key(chart_type, rows);
        if let Some(hit) = self.lock().map.get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(chart_type, "insight cache hit");
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let insight = engine.generate_insight(chart_type, rows).await?;
        self.insert(key, insight.clone());
        Ok(insight)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: String, insight: String) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if inner.map.insert(key.clone(), insight).is_none() {
            inner.order.push_back(key);
        }
        while inner.map.len() > self.capacity {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.map.remove(&old);
                }
                None => break,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeywordLlmEngine;
    use serde_json::json;

    fn rows(n: i64) -> Vec<Row> {
        (0..n)
            .filter_map(|i| json!({"Date": i, "Product A": i * 2}).as_object().cloned())
            .collect()
    }

    #[tokio::test]
    async fn same_data_is_generated_once() {
        let cache = InsightCache::new(8);
        let engine = KeywordLlmEngine::new();
        let a = cache.get_or_generate(&engine, "line", &rows(3)).await.unwrap();
        let b = cache.get_or_generate(&engine, "line", &rows(3)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        cache.get_or_generate(&engine, "map", &rows(3)).await.unwrap();
        assert_eq!(cache.misses(), 2);
    }

    #[tokio::test]
    async fn oldest_insight_is_dropped_at_capacity() {
        let cache = InsightCache::new(2);
        let engine = KeywordLlmEngine::new();
        for n in 1..=3 {
            cache.get_or_generate(&engine, "line", &rows(n)).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        cache.get_or_generate(&engine, "line", &rows(1)).await.unwrap();
        assert_eq!(cache.misses(), 4);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = InsightCache::new(2);
        let err = cache
            .get_or_generate(&crate::NullLlmEngine, "line", &rows(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
        assert!(cache.is_empty());
    }
}
