use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use xchat_types::{FreshnessToken, QueryDescriptor, Row};

use crate::{eval, DataSource, GatewayError};

/// In-memory backing store.
///
/// Every mutation of a table bumps its version, and the version doubles as
/// the freshness token. Versions come from one counter so a dropped and
/// recreated table never reuses an old token.
pub struct InMemoryDataSource {
    tables: RwLock<HashMap<String, Table>>,
    next_version: AtomicU64,
    latency: Duration,
    offline: AtomicBool,
    fetches: AtomicU64,
}

struct Table {
    rows: Arc<Vec<Row>>,
    columns: Vec<String>,
    version: u64,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            latency: Duration::ZERO,
            offline: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        }
    }

    /// Simulated scan cost paid by every `fetch` (not by `freshness_token`).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the contents of `table`, creating it if needed. Returns the
    /// new freshness token.
    ///
    /// The schema is taken from the new rows. Emptying a table keeps its
    /// previous columns, so queries naming them still match zero rows.
    pub async fn replace_table(&self, table: &str, rows: Vec<Row>) -> FreshnessToken {
        self.define_table(table, Vec::new(), rows).await
    }

    /// Replace `table` with an explicit schema. Columns found only in `rows`
    /// are appended after `columns`.
    pub async fn define_table(&self, table: &str, columns: Vec<String>, rows: Vec<Row>) -> FreshnessToken {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.tables.write().await;
        let columns = match inner.get(table) {
            Some(previous) if rows.is_empty() && columns.is_empty() => previous.columns.clone(),
            _ => column_union(&rows, columns),
        };
        inner.insert(
            table.to_string(),
            Table {
                rows: Arc::new(rows),
                columns,
                version,
            },
        );
        tracing::debug!(table, version, "table replaced");
        FreshnessToken(version)
    }

    pub async fn append_rows(&self, table: &str, rows: Vec<Row>) -> FreshnessToken {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.tables.write().await;
        let entry = inner.entry(table.to_string()).or_insert_with(|| Table {
            rows: Arc::new(Vec::new()),
            columns: Vec::new(),
            version,
        });
        let mut merged = entry.rows.as_ref().clone();
        merged.extend(rows);
        entry.columns = column_union(&merged, std::mem::take(&mut entry.columns));
        entry.rows = Arc::new(merged);
        entry.version = version;
        FreshnessToken(version)
    }

    /// Simulate an outage: every call fails with `SourceUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `fetch` calls that reached the backing store.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn table_names(&self) -> Vec<String> {
        let inner = self.tables.read().await;
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        names
    }

    fn check_online(&self) -> Result<(), GatewayError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(GatewayError::SourceUnavailable(
                "backing store is offline".into(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

fn column_union(rows: &[Row], mut columns: Vec<String>) -> Vec<String> {
    for row in rows {
        for key in row.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn unknown_source(source: &str) -> GatewayError {
    GatewayError::InvalidDescriptor(format!("unknown data source '{source}'"))
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Vec<Row>, GatewayError> {
        self.check_online()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let (rows, columns) = {
            let inner = self.tables.read().await;
            let table = inner
                .get(&descriptor.raw_data_source)
                .ok_or_else(|| unknown_source(&descriptor.raw_data_source))?;
            (Arc::clone(&table.rows), table.columns.clone())
        };
        eval::evaluate(&rows, &columns, descriptor)
    }

    async fn freshness_token(&self, source: &str) -> Result<FreshnessToken, GatewayError> {
        self.check_online()?;
        let inner = self.tables.read().await;
        inner
            .get(source)
            .map(|t| FreshnessToken(t.version))
            .ok_or_else(|| unknown_source(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: &[serde_json::Value]) -> Vec<Row> {
        values
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn mutations_change_the_freshness_token() {
        let source = InMemoryDataSource::new();
        let t1 = source.replace_table("t", rows(&[json!({"a": 1})])).await;
        assert_eq!(source.freshness_token("t").await.unwrap(), t1);

        let t2 = source.append_rows("t", rows(&[json!({"a": 2, "b": 3})])).await;
        assert_ne!(t1, t2);
        assert_eq!(source.freshness_token("t").await.unwrap(), t2);

        let all = source.fetch(&QueryDescriptor::new("t")).await.unwrap();
        assert_eq!(all.len(), 2);
        // Columns introduced by later rows are queryable.
        let only_b = source
            .fetch(&QueryDescriptor::new("t").columns(["b"]))
            .await
            .unwrap();
        assert_eq!(only_b[1]["b"], json!(3));
    }

    #[tokio::test]
    async fn emptied_table_keeps_its_schema() {
        let source = InMemoryDataSource::new();
        source.replace_table("t", rows(&[json!({"day": "2026-02-01", "units": 4})])).await;
        let before = source.freshness_token("t").await.unwrap();
        let after = source.replace_table("t", Vec::new()).await;
        assert_ne!(before, after);

        let out = source
            .fetch(&QueryDescriptor::new("t").columns(["day", "units"]))
            .await
            .unwrap();
        assert!(out.is_empty());
        // A table that never had rows only knows what it was told.
        source.replace_table("fresh", Vec::new()).await;
        assert!(source
            .fetch(&QueryDescriptor::new("fresh").columns(["day"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn explicit_columns_define_the_schema() {
        let source = InMemoryDataSource::new();
        source
            .define_table("t", vec!["day".into(), "units".into()], rows(&[json!({"units": 1, "note": "x"})]))
            .await;
        let out = source
            .fetch(&QueryDescriptor::new("t").columns(["day", "note"]))
            .await
            .unwrap();
        assert_eq!(out[0]["note"], json!("x"));
        assert!(out[0].get("day").is_none());
    }

    #[tokio::test]
    async fn unknown_source_is_a_permanent_error() {
        let source = InMemoryDataSource::new();
        let err = source.fetch(&QueryDescriptor::new("missing")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(source.freshness_token("missing").await.is_err());
    }

    #[tokio::test]
    async fn offline_source_is_retryable() {
        let source = InMemoryDataSource::new();
        source.replace_table("t", rows(&[json!({"a": 1})])).await;
        source.set_offline(true);
        let err = source.fetch(&QueryDescriptor::new("t")).await.unwrap_err();
        assert!(err.is_retryable());
        source.set_offline(false);
        assert!(source.fetch(&QueryDescriptor::new("t")).await.is_ok());
    }
}
